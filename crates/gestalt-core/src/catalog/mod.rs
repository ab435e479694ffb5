//! Record layouts of the Swift 5 reflection sections.
//!
//! Every layout here is an ordinary [`LayoutSpec`], built once per byte order
//! on first use and shared for the rest of the process. The engine knows
//! nothing about them: the scanner looks them up by [`SectionRole`] through
//! [`layout_for`], and the typed views ([`FieldDescriptor`],
//! [`AssociatedTypeDescriptor`], ...) turn decoded records into plain Rust
//! values, resolving pointers and names on the way.
//!
//! ## Example
//!
//! ```
//! use gestalt_core::catalog::{self, FieldDescriptor, CatalogRecord};
//! use gestalt_core::layout::ByteOrder;
//! use gestalt_core::SectionRole;
//!
//! let spec = catalog::layout_for(SectionRole::FieldMetadata, ByteOrder::Little).unwrap();
//! assert_eq!(spec.fixed_size(), 16);
//! assert_eq!(FieldDescriptor::ROLE, SectionRole::FieldMetadata);
//! ```

mod assoc;
mod builtin;
mod capture;
mod context;
mod fields;
mod protocols;

use crate::decode::Record;
use crate::error::{Error, Result};
use crate::layout::{ByteOrder, LayoutSpec};
use crate::resolve::{NameDecoder, RelativePointerResolver};
use crate::scanner::SectionRole;
use std::sync::{Arc, OnceLock};

pub use assoc::{
    associated_type_descriptor, associated_type_record, AssociatedType, AssociatedTypeDescriptor,
};
pub use builtin::{builtin_type_descriptor, BuiltinTypeDescriptor};
pub use capture::{capture_descriptor, CaptureDescriptor, MetadataSource};
pub use context::{
    context_descriptor, type_context_descriptor, type_reference_record, ContextDescriptorKind,
    TypeContextDescriptor, TypeReference, TypeReferenceKind,
};
pub use fields::{
    field_descriptor, field_record, FieldDescriptor, FieldDescriptorKind, FieldRecord,
};
pub use protocols::{
    conformance_descriptor, conformance_record, generic_requirement, protocol_descriptor,
    protocol_record, protocol_requirement, GenericRequirement, ProtocolConformance,
    ProtocolDescriptor, ProtocolRecord, ProtocolRequirement, ProtocolRequirementKind,
    RequirementConstraint,
};

/// A typed view over the records of one section role
pub trait CatalogRecord: Sized {
    /// Role of the sections holding these records
    const ROLE: SectionRole;

    /// Layout the section's records are decoded with
    fn layout(order: ByteOrder) -> &'static Arc<LayoutSpec>;

    /// Builds the view from a decoded record
    fn from_record(
        record: &Record,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self>;
}

/// Layout of the records stored in sections of `role`, if they have one
///
/// String pools and the sections with no catalog entry yield `None`.
pub fn layout_for(role: SectionRole, order: ByteOrder) -> Option<&'static Arc<LayoutSpec>> {
    match role {
        SectionRole::FieldMetadata => Some(FieldDescriptor::layout(order)),
        SectionRole::AssociatedTypes => Some(AssociatedTypeDescriptor::layout(order)),
        SectionRole::BuiltinTypes => Some(BuiltinTypeDescriptor::layout(order)),
        SectionRole::Captures => Some(CaptureDescriptor::layout(order)),
        SectionRole::Protocols => Some(ProtocolRecord::layout(order)),
        SectionRole::ProtocolConformances => Some(ProtocolConformance::layout(order)),
        SectionRole::TypeReferences => Some(TypeReference::layout(order)),
        _ => None,
    }
}

/// One lazily built spec per byte order
type SpecCells = [OnceLock<Arc<LayoutSpec>>; 2];

fn cached(
    cells: &'static SpecCells,
    order: ByteOrder,
    build: impl FnOnce(ByteOrder) -> Result<LayoutSpec>,
) -> &'static Arc<LayoutSpec> {
    let index = match order {
        ByteOrder::Little => 0,
        ByteOrder::Big => 1,
    };
    // catalog layouts are constants, every one is built by `test_all_layouts_build`
    cells[index].get_or_init(|| match build(order) {
        Ok(spec) => Arc::new(spec),
        Err(e) => unreachable!("catalog layout rejected by the builder: {e}"),
    })
}

/// Decodes a name pointer, treating a zero delta as an absent name
fn optional_name(
    record: &Record,
    field: &str,
    resolver: &RelativePointerResolver<'_>,
    names: &dyn NameDecoder,
) -> Result<Option<String>> {
    let pointer = record.pointer(field)?;
    if pointer.offset.is_null() {
        return Ok(None);
    }
    resolver.display_name(pointer, names).map(Some)
}

/// Maps a pointer leaving the image to `None`
///
/// Indirect references to other images read a slot that is only filled in
/// at load time, so their targets are legitimately outside this image.
fn unless_external<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(Error::RelativePointerOutOfRange { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Elements of a trailing block, in order
fn trailing_records<'r>(record: &'r Record, field: &str) -> Result<Vec<&'r Record>> {
    record
        .repeat(field)?
        .iter()
        .map(|item| {
            item.as_record()
                .ok_or_else(|| Error::unexpected_value(field, "a nested record"))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for assembling synthetic sections.

    /// Little-endian section contents with helpers for relative pointers
    #[derive(Debug, Default)]
    pub(crate) struct SectionBuilder {
        pub(crate) base: u64,
        pub(crate) bytes: Vec<u8>,
    }

    impl SectionBuilder {
        pub(crate) fn new(base: u64) -> Self {
            Self {
                base,
                bytes: Vec::new(),
            }
        }

        pub(crate) fn here(&self) -> u64 {
            self.base + self.bytes.len() as u64
        }

        pub(crate) fn u16(&mut self, value: u16) -> &mut Self {
            self.bytes.extend_from_slice(&value.to_le_bytes());
            self
        }

        pub(crate) fn u32(&mut self, value: u32) -> &mut Self {
            self.bytes.extend_from_slice(&value.to_le_bytes());
            self
        }

        /// Relative pointer from the current position to `target`
        pub(crate) fn rel(&mut self, target: u64) -> &mut Self {
            self.rel_tagged(target, 0)
        }

        /// Relative pointer with `bits` or-ed into its low bits
        pub(crate) fn rel_tagged(&mut self, target: u64, bits: u32) -> &mut Self {
            let delta = target as i64 - self.here() as i64;
            self.u32(delta as i32 as u32 | bits)
        }

        pub(crate) fn bytes(&mut self, data: &[u8]) -> &mut Self {
            self.bytes.extend_from_slice(data);
            self
        }
    }
}
