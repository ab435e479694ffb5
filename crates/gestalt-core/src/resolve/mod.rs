//! Resolution of self-relative pointers.
//!
//! Decoded pointer fields are [`RelativeOffset`]s: the address of the field,
//! the raw 32-bit value stored there, and the pointer's [`PointerKind`].
//! Nothing is dereferenced at decode time. A [`RelativePointerResolver`]
//! borrowed from an [`Image`] turns offsets into addresses on demand and
//! reads whatever lives there: another record, a C string, or a mangled name
//! run.
//!
//! The target of every pointer is `field_address + delta`, where the delta is
//! the raw value with its low tag and indirection bits cleared. A delta of 0
//! resolves to the field itself; deciding whether that means "absent" is up
//! to the record that contains the pointer.

mod names;

use crate::decode::{decode_record, ByteCursor, PointerValue, Record};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::layout::{low_bits, LayoutSpec, PointerKind, PointerTarget};
use tracing::trace;

pub use names::{symbolic_run_extent, NameDecoder, NamePiece, NameRun, VerbatimNames};

/// A pointer field as stored in the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeOffset {
    field_address: u64,
    raw: i32,
    kind: PointerKind,
}

impl RelativeOffset {
    /// Creates an offset for a field at `field_address` holding `raw`
    pub fn new(field_address: u64, raw: i32, kind: PointerKind) -> Self {
        Self {
            field_address,
            raw,
            kind,
        }
    }

    /// Address of the pointer field
    pub fn field_address(&self) -> u64 {
        self.field_address
    }

    /// Stored value, tag and indirection bits included
    pub fn raw(&self) -> i32 {
        self.raw
    }

    /// Encoding of the pointer
    pub fn kind(&self) -> PointerKind {
        self.kind
    }

    /// Distance from the field to its target
    pub fn delta(&self) -> i32 {
        self.raw & !self.kind.low_mask()
    }

    /// True when the delta is zero
    pub fn is_null(&self) -> bool {
        self.delta() == 0
    }

    /// Whether the target holds an absolute pointer to follow
    pub fn is_indirect(&self) -> bool {
        self.kind.is_indirectable() && self.raw & 1 != 0
    }

    /// Integer packed into the low bits, for tag-packed pointers
    pub fn tag(&self) -> Option<u32> {
        match self.kind {
            PointerKind::TagPacked {
                tag_bits,
                indirectable,
            } => {
                let bits = self.raw as u32 >> u32::from(indirectable);
                Some(bits & low_bits(u32::from(tag_bits)))
            }
            _ => None,
        }
    }

    /// `field_address + delta`, before any indirection
    pub fn target(&self) -> i128 {
        i128::from(self.field_address) + i128::from(self.delta())
    }
}

/// Outcome of resolving a [`RelativeOffset`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPointer {
    /// Final target address
    pub address: u64,
    /// Tag carried by tag-packed pointers
    pub tag: Option<u32>,
    /// For indirect pointers, where the absolute pointer was read from
    pub slot: Option<u64>,
}

/// Resolves relative pointers against one image
#[derive(Debug, Clone, Copy)]
pub struct RelativePointerResolver<'img> {
    image: &'img Image,
}

impl<'img> RelativePointerResolver<'img> {
    /// Creates a resolver for `image`
    pub fn new(image: &'img Image) -> Self {
        Self { image }
    }

    /// The image pointers are resolved against
    pub fn image(&self) -> &'img Image {
        self.image
    }

    /// Computes the target address of `offset`
    ///
    /// Fails with `RelativePointerOutOfRange` when `field_address + delta`
    /// falls outside every section of the image. An indirect pointer must
    /// also find a whole absolute pointer at that address; the value read
    /// from it is returned as is, since it may only be bound at load time.
    pub fn resolve(&self, offset: &RelativeOffset) -> Result<ResolvedPointer> {
        let field = offset.field_address();
        let target = offset.target();
        let address = u64::try_from(target)
            .ok()
            .filter(|&address| self.image.section_containing(address).is_some())
            .ok_or_else(|| Error::pointer_out_of_range(field, target))?;

        if !offset.is_indirect() {
            return Ok(ResolvedPointer {
                address,
                tag: offset.tag(),
                slot: None,
            });
        }

        let (absolute, _) = self
            .locate(field, address)?
            .read_uint(self.image.pointer_width(), self.image.byte_order())?;
        trace!("Indirect pointer at {:#x} via slot {:#x}", field, address);
        Ok(ResolvedPointer {
            address: absolute,
            tag: offset.tag(),
            slot: Some(address),
        })
    }

    /// Cursor positioned at `address`, bounded by its section
    pub fn cursor_at(&self, address: u64) -> Result<ByteCursor<'img>> {
        self.locate(address, address)
    }

    fn locate(&self, field: u64, address: u64) -> Result<ByteCursor<'img>> {
        self.image
            .section_containing(address)
            .and_then(|section| section.cursor_at(address))
            .ok_or_else(|| Error::pointer_out_of_range(field, i128::from(address)))
    }

    /// Bytes of the NUL-terminated string at `address`, terminator excluded
    pub fn c_string_at(&self, address: u64) -> Result<&'img [u8]> {
        let rest = self.cursor_at(address)?.rest();
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::buffer_too_short(address, rest.len() + 1, rest.len()))?;
        Ok(&rest[..end])
    }

    /// The mangled name run at `address`, sized by `names`
    pub fn name_run_at(&self, address: u64, names: &dyn NameDecoder) -> Result<NameRun<'img>> {
        let rest = self.cursor_at(address)?.rest();
        let width = self.image.pointer_width();
        let end = names
            .run_extent(rest, width)
            .ok_or_else(|| Error::buffer_too_short(address, rest.len() + 1, rest.len()))?;
        Ok(NameRun {
            address,
            bytes: &rest[..end],
            pointer_width: width,
            byte_order: self.image.byte_order(),
        })
    }

    /// Reads the string a name pointer refers to and decodes it
    pub fn display_name(&self, pointer: &PointerValue, names: &dyn NameDecoder) -> Result<String> {
        let resolved = self.resolve(&pointer.offset)?;
        match pointer.target {
            PointerTarget::CString => {
                let bytes = self.c_string_at(resolved.address)?;
                Ok(names.decode(&String::from_utf8_lossy(bytes)))
            }
            PointerTarget::SymbolicName => {
                let run = self.name_run_at(resolved.address, names)?;
                Ok(names.decode_run(&run))
            }
            PointerTarget::Layout(_) | PointerTarget::Opaque => {
                Err(Error::unexpected_value("pointer target", "a name"))
            }
        }
    }

    /// Decodes the record a layout pointer refers to
    pub fn follow(&self, pointer: &PointerValue) -> Result<Record> {
        match &pointer.target {
            PointerTarget::Layout(spec) => self.follow_as(&pointer.offset, spec),
            _ => Err(Error::unexpected_value("pointer target", "a record layout")),
        }
    }

    /// Decodes the target of `offset` as a record described by `spec`
    pub fn follow_as(&self, offset: &RelativeOffset, spec: &LayoutSpec) -> Result<Record> {
        let resolved = self.resolve(offset)?;
        let cursor = self.locate(offset.field_address(), resolved.address)?;
        decode_record(spec, cursor).map(|(record, _)| record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageId, LoadedObject};
    use crate::layout::{ByteOrder, ScalarKind};
    use std::sync::Arc;

    const BASE: u64 = 0x1000;

    fn image(contents: Vec<u8>) -> Image {
        let object = LoadedObject::new().with_section("__data", BASE, contents);
        Image::from_object(ImageId::new(0), "test.dylib", object)
    }

    const INDIRECTABLE_TAG: PointerKind = PointerKind::TagPacked {
        tag_bits: 1,
        indirectable: true,
    };

    #[test]
    fn test_direct_delta() {
        let image = image(vec![0; 64]);
        let resolver = image.resolver();
        let offset = RelativeOffset::new(BASE + 8, 16, PointerKind::Direct);
        assert_eq!(resolver.resolve(&offset).unwrap().address, BASE + 24);

        let back = RelativeOffset::new(BASE + 8, -8, PointerKind::Direct);
        assert_eq!(resolver.resolve(&back).unwrap().address, BASE);
    }

    #[test]
    fn test_zero_delta_resolves_to_field() {
        let image = image(vec![0; 16]);
        let offset = RelativeOffset::new(BASE + 4, 0, PointerKind::Direct);
        assert!(offset.is_null());
        assert_eq!(image.resolver().resolve(&offset).unwrap().address, BASE + 4);
    }

    #[test]
    fn test_out_of_range() {
        let image = image(vec![0; 16]);
        let offset = RelativeOffset::new(BASE, 16, PointerKind::Direct);
        match image.resolver().resolve(&offset) {
            Err(Error::RelativePointerOutOfRange {
                field_address,
                target,
            }) => {
                assert_eq!(field_address, BASE);
                assert_eq!(target, i128::from(BASE + 16));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let negative = RelativeOffset::new(4, -8, PointerKind::Direct);
        assert!(image.resolver().resolve(&negative).is_err());
    }

    #[test]
    fn test_indirect_reads_absolute_pointer() {
        let mut contents = vec![0u8; 32];
        contents[16..24].copy_from_slice(&0xDEAD_0000u64.to_le_bytes());
        let image = image(contents);

        let offset = RelativeOffset::new(BASE, 16 | 1, PointerKind::Indirectable);
        assert!(offset.is_indirect());
        let resolved = image.resolver().resolve(&offset).unwrap();
        assert_eq!(resolved.address, 0xDEAD_0000);
        assert_eq!(resolved.slot, Some(BASE + 16));

        let direct = RelativeOffset::new(BASE, 16, PointerKind::Indirectable);
        assert_eq!(image.resolver().resolve(&direct).unwrap().address, BASE + 16);
    }

    #[test]
    fn test_indirect_slot_truncated() {
        let image = image(vec![0u8; 20]);
        let offset = RelativeOffset::new(BASE, 16 | 1, PointerKind::Indirectable);
        assert!(matches!(
            image.resolver().resolve(&offset),
            Err(Error::BufferTooShort { needed: 8, .. })
        ));
    }

    #[test]
    fn test_tag_packed() {
        let plain = RelativeOffset::new(
            BASE,
            0x20 | 0b10,
            PointerKind::TagPacked {
                tag_bits: 2,
                indirectable: false,
            },
        );
        assert_eq!(plain.tag(), Some(2));
        assert_eq!(plain.delta(), 0x20);
        assert!(!plain.is_indirect());

        let both = RelativeOffset::new(BASE, 0x20 | 0b10, INDIRECTABLE_TAG);
        assert_eq!(both.tag(), Some(1));
        assert!(!both.is_indirect());

        let image = image(vec![0; 64]);
        let resolved = image.resolver().resolve(&both).unwrap();
        assert_eq!(resolved.address, BASE + 0x20);
        assert_eq!(resolved.tag, Some(1));
    }

    #[test]
    fn test_wide_tag_does_not_overflow() {
        let kind = PointerKind::TagPacked {
            tag_bits: 31,
            indirectable: false,
        };
        let offset = RelativeOffset::new(0, 4, kind);
        assert_eq!(offset.delta(), 0);
        assert_eq!(offset.tag(), Some(4));
        assert!(offset.is_null());
    }

    #[test]
    fn test_negative_delta_keeps_tag_bits_out() {
        let offset = RelativeOffset::new(BASE + 0x40, -0x20 | 0b01, INDIRECTABLE_TAG);
        assert_eq!(offset.delta(), -0x20);
        assert!(offset.is_indirect());
        assert_eq!(offset.tag(), Some(0));
    }

    #[test]
    fn test_strings_and_names() {
        let mut contents = b"Point\0".to_vec();
        contents.extend_from_slice(&[0x01, 0xFA, 0xFF, 0xFF, 0xFF, b'V', 0]);
        let image = image(contents);
        let resolver = image.resolver();

        assert_eq!(resolver.c_string_at(BASE).unwrap(), b"Point");
        let run = resolver.name_run_at(BASE + 6, &VerbatimNames).unwrap();
        assert_eq!(run.bytes.len(), 6);
        assert_eq!(VerbatimNames.decode_run(&run), "<ref 0x01 @0x1001>V");

        assert!(matches!(
            resolver.c_string_at(BASE + 12),
            Ok(bytes) if bytes.is_empty()
        ));
    }

    #[test]
    fn test_unterminated_string() {
        let image = image(b"abc".to_vec());
        assert!(matches!(
            image.resolver().c_string_at(BASE),
            Err(Error::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_follow_decodes_target() {
        let target = Arc::new(
            LayoutSpec::builder("Target")
                .byte_order(ByteOrder::Little)
                .scalar("value", ScalarKind::U32)
                .build()
                .unwrap(),
        );
        let mut contents = 8i32.to_le_bytes().to_vec();
        contents.extend_from_slice(&[0; 4]);
        contents.extend_from_slice(&0xABCDu32.to_le_bytes());
        let image = image(contents);

        let pointer = PointerValue {
            offset: RelativeOffset::new(BASE, 8, PointerKind::Direct),
            target: PointerTarget::Layout(target),
        };
        let record = image.resolver().follow(&pointer).unwrap();
        assert_eq!(record.address(), BASE + 8);
        assert_eq!(record.u64("value").unwrap(), 0xABCD);
    }
}
