//! # gestalt-core
//!
//! A library for decoding the Swift 5 reflection metadata that the compiler
//! embeds in the sections of Mach-O, ELF and PE/COFF binaries.
//!
//! This crate provides the core functionality for:
//! - Describing fixed-format binary records declaratively
//! - Decoding bytes against those descriptions with strict bounds checks
//! - Resolving the self-relative pointers the records are linked with
//! - Scanning images for metadata sections and decoding their records
//!
//! ## Architecture
//!
//! The library is organized into several modules, leaves first:
//!
//! - [`layout`]: Record descriptions ([`LayoutSpec`]) and their builder
//! - [`decode`]: The decode engine and [`ByteReader`] combinators
//! - [`resolve`]: Relative pointer resolution and name runs
//! - [`image`]: Loaded images and the object file reader seam
//! - [`scanner`]: Section classification and record collection
//! - [`catalog`]: Layouts and typed views of the Swift 5 records
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use gestalt_core::catalog::FieldDescriptor;
//! use gestalt_core::{Scanner, VerbatimNames};
//!
//! let mut scanner = Scanner::new();
//! scanner.add_image("./target/release/MyApp")?;
//!
//! for descriptor in scanner.typed_records::<FieldDescriptor>(&VerbatimNames) {
//!     let descriptor = descriptor?;
//!     println!("{:?} has {} fields", descriptor.type_name, descriptor.fields.len());
//! }
//! # Ok::<(), gestalt_core::Error>(())
//! ```
//!
//! ## Extensibility
//!
//! The library provides several traits for customization:
//!
//! - [`ObjectFileReader`]: Customize how container files are opened
//! - [`NameDecoder`]: Customize how mangled names are rendered
//! - [`CatalogRecord`]: Add typed views over further record kinds
//!

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod catalog;
pub mod decode;
pub mod error;
pub mod image;
pub mod layout;
pub mod resolve;
pub mod scanner;

// Re-export primary types for convenience
pub use catalog::CatalogRecord;
pub use decode::{decode, decode_at, ByteCursor, ByteReader, DecodedValue, Record};
pub use error::{Error, Result};
pub use image::{Image, ImageId, LoadedObject, ObjectFileReader, ObjectReader};
pub use layout::{ByteOrder, LayoutSpec};
pub use resolve::{NameDecoder, RelativeOffset, RelativePointerResolver, VerbatimNames};
pub use scanner::{
    DecodedRecord, FailurePolicy, ScanIssue, Scanner, ScannerConfig, ScannerState, SectionRole,
    SectionTable,
};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
