//! Error types for the gestalt-core library.
//!
//! This module provides a single error enum built with the `thiserror` crate.
//! Decode failures carry the buffer address at which they occurred so callers
//! can report the failing stage and position.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for gestalt operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all gestalt operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read an input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The object file reader could not parse an image
    #[error("failed to parse object file '{path}': {details}")]
    FileFormat {
        /// Path to the image
        path: PathBuf,
        /// Reader-provided description of the failure
        details: String,
    },

    /// Fewer bytes remain than a declared field needs
    #[error("buffer too short at {offset:#x}: need {needed} bytes, {available} available")]
    BufferTooShort {
        /// Address where the read was attempted
        offset: u64,
        /// Bytes the field declares
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// A union discriminant matched none of its alternatives
    #[error("unsupported discriminant {value:#x} for union '{field}' at {offset:#x}")]
    DiscriminantUnsupported {
        /// Name of the union field
        field: String,
        /// Discriminant value after masking
        value: u64,
        /// Address of the union payload
        offset: u64,
    },

    /// A relative pointer resolved outside every section of its image
    #[error("relative pointer at {field_address:#x} resolves to {target:#x}, outside the image")]
    RelativePointerOutOfRange {
        /// Address of the pointer field
        field_address: u64,
        /// Computed target address
        target: i128,
    },

    /// A section name matched no entry of the section table
    #[error("unrecognized section '{name}'")]
    UnrecognizedSection {
        /// Name of the section
        name: String,
    },

    /// A layout spec failed validation when built
    #[error("invalid layout '{layout}': {details}")]
    InvalidLayout {
        /// Name of the spec being built
        layout: String,
        /// What was wrong with it
        details: String,
    },

    /// A count, stride or discriminant source was not found while decoding
    #[error("field '{name}' is not available at {offset:#x}")]
    UnknownField {
        /// Name that was looked up
        name: String,
        /// Address where the lookup happened
        offset: u64,
    },

    /// A trailing stride is smaller than the element it repeats
    #[error("stride {stride} at {offset:#x} is smaller than element size {element_size}")]
    InvalidStride {
        /// Stride read from the header
        stride: u64,
        /// Fixed size of the element spec
        element_size: usize,
        /// Address of the trailing block
        offset: u64,
    },

    /// An image id does not (or no longer) refer to a loaded image
    #[error("image {0} is not loaded")]
    UnknownImage(usize),

    /// A decoded value did not have the shape a typed view expected
    #[error("unexpected value for '{field}': expected {expected}")]
    UnexpectedValue {
        /// Field that was inspected
        field: String,
        /// Description of the expected shape
        expected: &'static str,
    },
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new file format error
    pub fn file_format(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        Self::FileFormat {
            path: path.into(),
            details: details.into(),
        }
    }

    /// Creates a new short buffer error
    pub fn buffer_too_short(offset: u64, needed: usize, available: usize) -> Self {
        Self::BufferTooShort {
            offset,
            needed,
            available,
        }
    }

    /// Creates a new unsupported discriminant error
    pub fn discriminant_unsupported(field: impl Into<String>, value: u64, offset: u64) -> Self {
        Self::DiscriminantUnsupported {
            field: field.into(),
            value,
            offset,
        }
    }

    /// Creates a new out-of-range pointer error
    pub fn pointer_out_of_range(field_address: u64, target: i128) -> Self {
        Self::RelativePointerOutOfRange {
            field_address,
            target,
        }
    }

    /// Creates a new layout validation error
    pub fn invalid_layout(layout: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvalidLayout {
            layout: layout.into(),
            details: details.into(),
        }
    }

    /// Creates a new unknown field error
    pub fn unknown_field(name: impl Into<String>, offset: u64) -> Self {
        Self::UnknownField {
            name: name.into(),
            offset,
        }
    }

    /// Creates a new unexpected value error
    pub fn unexpected_value(field: impl Into<String>, expected: &'static str) -> Self {
        Self::UnexpectedValue {
            field: field.into(),
            expected,
        }
    }

    /// Returns the buffer address the error refers to, if any
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::BufferTooShort { offset, .. }
            | Self::DiscriminantUnsupported { offset, .. }
            | Self::UnknownField { offset, .. }
            | Self::InvalidStride { offset, .. } => Some(*offset),
            Self::RelativePointerOutOfRange { field_address, .. } => Some(*field_address),
            _ => None,
        }
    }

    /// Returns true if this error stems from corrupt input and may be skipped
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BufferTooShort { .. }
                | Self::DiscriminantUnsupported { .. }
                | Self::RelativePointerOutOfRange { .. }
                | Self::InvalidStride { .. }
                | Self::UnrecognizedSection { .. }
                | Self::UnexpectedValue { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::buffer_too_short(0x40, 4, 2);
        assert!(err.to_string().contains("0x40"));
        assert!(err.to_string().contains("need 4 bytes"));
    }

    #[test]
    fn test_offset() {
        assert_eq!(Error::pointer_out_of_range(0x10, -4).offset(), Some(0x10));
        assert_eq!(Error::UnknownImage(3).offset(), None);
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::discriminant_unsupported("param", 9, 0).is_recoverable());
        assert!(!Error::file_format("/bin/true", "bad magic").is_recoverable());
        assert!(!Error::invalid_layout("x", "y").is_recoverable());
    }
}
