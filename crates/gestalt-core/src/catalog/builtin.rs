//! Builtin type descriptors (`__swift5_builtin`).

use super::{cached, optional_name, CatalogRecord, SpecCells};
use crate::decode::Record;
use crate::error::Result;
use crate::layout::{ByteOrder, LayoutSpec, PointerKind, PointerTarget, ScalarKind};
use crate::resolve::{NameDecoder, RelativePointerResolver};
use crate::scanner::SectionRole;
use std::sync::{Arc, OnceLock};

const ALIGNMENT_MASK: u64 = 0xFFFF;
const BITWISE_TAKABLE: u64 = 1 << 16;

/// Layout of a builtin type's size and alignment record
pub fn builtin_type_descriptor(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("BuiltinTypeDescriptor")
            .byte_order(order)
            .pointer("type_name", PointerKind::Direct, PointerTarget::SymbolicName)
            .scalar("size", ScalarKind::U32)
            .flags(
                "alignment_and_flags",
                ScalarKind::U32,
                &[("bitwise_takable", BITWISE_TAKABLE)],
            )
            .scalar("stride", ScalarKind::U32)
            .scalar("num_extra_inhabitants", ScalarKind::U32)
            .build()
    })
}

/// Value layout of a type the compiler treats as opaque
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinTypeDescriptor {
    /// Address of the descriptor
    pub address: u64,
    /// Mangled type name
    pub type_name: Option<String>,
    /// Size in bytes
    pub size: u32,
    /// Alignment in bytes
    pub alignment: u32,
    /// Distance between array elements
    pub stride: u32,
    /// Spare bit patterns usable by enclosing enums
    pub extra_inhabitants: u32,
    /// Whether values can be moved with a plain copy
    pub bitwise_takable: bool,
}

impl CatalogRecord for BuiltinTypeDescriptor {
    const ROLE: SectionRole = SectionRole::BuiltinTypes;

    fn layout(order: ByteOrder) -> &'static Arc<LayoutSpec> {
        builtin_type_descriptor(order)
    }

    fn from_record(
        record: &Record,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        let flags = record.flags("alignment_and_flags")?;
        Ok(Self {
            address: record.address(),
            type_name: optional_name(record, "type_name", resolver, names)?,
            size: record.u64("size")? as u32,
            alignment: flags.field(ALIGNMENT_MASK, 0) as u32,
            stride: record.u64("stride")? as u32,
            extra_inhabitants: record.u64("num_extra_inhabitants")? as u32,
            bitwise_takable: flags.contains("bitwise_takable"),
        })
    }
}
