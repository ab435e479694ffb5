//! Loaded binary images and their sections.
//!
//! An [`Image`] is what the scanner keeps for every successfully added file:
//! its named sections (each with the address it is mapped at and its bytes),
//! its symbols, and the pointer width and byte order of the container.
//! Section contents are [`Bytes`] slices of one shared backing buffer, so
//! sections, cursors and decoded records never copy file data.
//!
//! Getting from a path to a [`LoadedObject`] is the job of an
//! [`ObjectFileReader`]; [`ObjectReader`] is the default implementation.

mod reader;

use crate::decode::ByteCursor;
use crate::error::{Error, Result};
use crate::layout::ByteOrder;
use crate::resolve::RelativePointerResolver;
use bytes::Bytes;
use std::fmt;
use std::path::{Path, PathBuf};

pub use reader::{ObjectFileReader, ObjectReader};

/// A named, mapped byte range of an image
#[derive(Debug, Clone)]
pub struct SectionData {
    /// Section name as stored in the container
    pub name: String,
    /// Address of the first byte
    pub address: u64,
    /// Section bytes
    pub contents: Bytes,
}

impl SectionData {
    /// Creates a new section
    pub fn new(name: impl Into<String>, address: u64, contents: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            address,
            contents: contents.into(),
        }
    }

    /// Address one past the last byte, saturating at the top of the address space
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.contents.len() as u64)
    }

    /// Whether every byte of the section has an address below `u64::MAX`
    pub fn fits_address_space(&self) -> bool {
        u64::try_from(self.contents.len())
            .ok()
            .and_then(|len| self.address.checked_add(len))
            .is_some()
    }

    /// Whether `address` lies inside the section
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.end()
    }

    /// Cursor over the whole section
    pub fn cursor(&self) -> ByteCursor<'_> {
        ByteCursor::with_origin(&self.contents, self.address)
    }

    /// Cursor positioned at `address`, if it lies inside the section
    pub fn cursor_at(&self, address: u64) -> Option<ByteCursor<'_>> {
        if !self.contains(address) {
            return None;
        }
        let skip = usize::try_from(address - self.address).ok()?;
        self.cursor().advance(skip).ok()
    }
}

/// A named address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name, undecoded
    pub name: String,
    /// Address the symbol is defined at
    pub address: u64,
}

/// Everything an [`ObjectFileReader`] extracts from one file
#[derive(Debug, Clone)]
pub struct LoadedObject {
    /// Sections in container order
    pub sections: Vec<SectionData>,
    /// Defined symbols
    pub symbols: Vec<Symbol>,
    /// Width of absolute pointers in bytes
    pub pointer_width: usize,
    /// Byte order of the container
    pub byte_order: ByteOrder,
}

impl Default for LoadedObject {
    fn default() -> Self {
        Self {
            sections: Vec::new(),
            symbols: Vec::new(),
            pointer_width: 8,
            byte_order: ByteOrder::Little,
        }
    }
}

impl LoadedObject {
    /// Creates an empty 64-bit little-endian object
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a section
    pub fn with_section(
        mut self,
        name: impl Into<String>,
        address: u64,
        contents: impl Into<Bytes>,
    ) -> Self {
        self.sections.push(SectionData::new(name, address, contents));
        self
    }

    /// Adds a symbol
    pub fn with_symbol(mut self, name: impl Into<String>, address: u64) -> Self {
        self.symbols.push(Symbol {
            name: name.into(),
            address,
        });
        self
    }

    /// Sets the pointer width
    pub fn pointer_width(mut self, width: usize) -> Self {
        self.pointer_width = width;
        self
    }

    /// Sets the byte order
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    /// Rejects sections that run past the end of the address space
    ///
    /// `path` only names the object in the error.
    pub fn check_address_space(&self, path: impl Into<PathBuf>) -> Result<()> {
        match self.sections.iter().find(|section| !section.fits_address_space()) {
            Some(section) => Err(Error::file_format(
                path,
                format!(
                    "section {} at {:#x} ({} bytes) overflows the address space",
                    section.name,
                    section.address,
                    section.contents.len()
                ),
            )),
            None => Ok(()),
        }
    }
}

/// Identifies an image within a scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageId(usize);

impl ImageId {
    /// Wraps a raw index
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Raw index
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A loaded image
#[derive(Debug, Clone)]
pub struct Image {
    id: ImageId,
    path: PathBuf,
    sections: Vec<SectionData>,
    symbols: Vec<Symbol>,
    pointer_width: usize,
    byte_order: ByteOrder,
}

impl Image {
    pub(crate) fn from_object(id: ImageId, path: impl Into<PathBuf>, object: LoadedObject) -> Self {
        let mut symbols = object.symbols;
        symbols.sort_by_key(|symbol| symbol.address);
        Self {
            id,
            path: path.into(),
            sections: object.sections,
            symbols,
            pointer_width: object.pointer_width,
            byte_order: object.byte_order,
        }
    }

    /// Id assigned by the scanner
    pub fn id(&self) -> ImageId {
        self.id
    }

    /// Path (or name) the image was added under
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sections in container order
    pub fn sections(&self) -> &[SectionData] {
        &self.sections
    }

    /// First section with the given name
    pub fn section(&self, name: &str) -> Option<&SectionData> {
        self.sections.iter().find(|section| section.name == name)
    }

    /// Section holding `address`
    pub fn section_containing(&self, address: u64) -> Option<&SectionData> {
        self.sections.iter().find(|section| section.contains(address))
    }

    /// Symbols sorted by address
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Symbol defined exactly at `address`
    pub fn symbol_at(&self, address: u64) -> Option<&Symbol> {
        let index = self
            .symbols
            .partition_point(|symbol| symbol.address < address);
        self.symbols
            .get(index)
            .filter(|symbol| symbol.address == address)
    }

    /// Width of absolute pointers in bytes
    pub fn pointer_width(&self) -> usize {
        self.pointer_width
    }

    /// Byte order of the container
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Resolver for pointers decoded from this image
    pub fn resolver(&self) -> RelativePointerResolver<'_> {
        RelativePointerResolver::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> Image {
        let object = LoadedObject::new()
            .with_section("__text", 0x1000, vec![0u8; 0x100])
            .with_section("__swift5_fieldmd", 0x2000, vec![1u8, 2, 3, 4])
            .with_symbol("_b", 0x2002)
            .with_symbol("_a", 0x1000);
        Image::from_object(ImageId::new(3), "libDemo.dylib", object)
    }

    #[test]
    fn test_section_lookup() {
        let image = image();
        assert_eq!(image.section_containing(0x10FF).unwrap().name, "__text");
        assert!(image.section_containing(0x1100).is_none());
        assert_eq!(image.section_containing(0x2003).unwrap().end(), 0x2004);
        assert!(image.section("__swift5_fieldmd").is_some());
    }

    #[test]
    fn test_cursor_at() {
        let image = image();
        let section = image.section("__swift5_fieldmd").unwrap();
        let cursor = section.cursor_at(0x2002).unwrap();
        assert_eq!(cursor.address(), 0x2002);
        assert_eq!(cursor.rest(), &[3, 4]);
        assert!(section.cursor_at(0x2004).is_none());
    }

    #[test]
    fn test_section_at_top_of_address_space() {
        let fits = SectionData::new("__swift5_builtin", u64::MAX - 20, vec![0u8; 20]);
        assert!(fits.fits_address_space());
        assert_eq!(fits.end(), u64::MAX);

        let wraps = SectionData::new("__swift5_builtin", u64::MAX - 4, vec![0u8; 20]);
        assert!(!wraps.fits_address_space());
        assert_eq!(wraps.end(), u64::MAX);

        let object = LoadedObject::new().with_section("__swift5_builtin", u64::MAX - 4, vec![0u8; 20]);
        match object.check_address_space("Corrupt") {
            Err(Error::FileFormat { path, details }) => {
                assert_eq!(path, Path::new("Corrupt"));
                assert!(details.contains("__swift5_builtin"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(image().sections().iter().all(SectionData::fits_address_space));
    }

    #[test]
    fn test_symbols_sorted() {
        let image = image();
        assert_eq!(image.symbols()[0].name, "_a");
        assert_eq!(image.symbol_at(0x2002).unwrap().name, "_b");
        assert!(image.symbol_at(0x2001).is_none());
        assert_eq!(image.id().to_string(), "#3");
    }
}
