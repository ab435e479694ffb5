//! Field descriptors (`__swift5_fieldmd`).

use super::{cached, optional_name, trailing_records, CatalogRecord, SpecCells};
use crate::decode::Record;
use crate::error::Result;
use crate::layout::{ByteOrder, LayoutSpec, PointerKind, PointerTarget, ScalarKind, TrailingRepeat};
use crate::resolve::{NameDecoder, RelativePointerResolver};
use crate::scanner::SectionRole;
use std::sync::{Arc, OnceLock};

/// Layout of one stored property or enum case
pub fn field_record(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("FieldRecord")
            .byte_order(order)
            .flags(
                "flags",
                ScalarKind::U32,
                &[
                    ("indirect_case", u64::from(FieldRecord::IS_INDIRECT_CASE)),
                    ("var", u64::from(FieldRecord::IS_VAR)),
                    ("artificial", u64::from(FieldRecord::IS_ARTIFICIAL)),
                ],
            )
            .pointer(
                "mangled_type_name",
                PointerKind::Direct,
                PointerTarget::SymbolicName,
            )
            .pointer("field_name", PointerKind::Direct, PointerTarget::CString)
            .build()
    })
}

/// Layout of a field descriptor and its trailing field records
pub fn field_descriptor(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("FieldDescriptor")
            .byte_order(order)
            .pointer(
                "mangled_type_name",
                PointerKind::Direct,
                PointerTarget::SymbolicName,
            )
            .pointer("superclass", PointerKind::Direct, PointerTarget::SymbolicName)
            .scalar("kind", ScalarKind::U16)
            .scalar("field_record_size", ScalarKind::U16)
            .scalar("num_fields", ScalarKind::U32)
            .trailing(
                "fields",
                TrailingRepeat::new("num_fields", Arc::clone(field_record(order)))
                    .stride("field_record_size"),
            )
            .build()
    })
}

/// What kind of declaration a field descriptor describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDescriptorKind {
    /// A struct
    Struct,
    /// A Swift class
    Class,
    /// An enum with at most one payload case
    Enum,
    /// An enum with several payload cases
    MultiPayloadEnum,
    /// A protocol
    Protocol,
    /// A class-bound protocol
    ClassProtocol,
    /// An Objective-C protocol
    ObjCProtocol,
    /// An Objective-C class
    ObjCClass,
    /// A kind this version does not know
    Unknown(u16),
}

impl FieldDescriptorKind {
    /// Interprets the stored kind
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Struct,
            1 => Self::Class,
            2 => Self::Enum,
            3 => Self::MultiPayloadEnum,
            4 => Self::Protocol,
            5 => Self::ClassProtocol,
            6 => Self::ObjCProtocol,
            7 => Self::ObjCClass,
            other => Self::Unknown(other),
        }
    }

    /// Whether the fields are enum cases
    pub fn is_enum(self) -> bool {
        matches!(self, Self::Enum | Self::MultiPayloadEnum)
    }
}

/// A stored property or enum case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRecord {
    /// Raw record flags
    pub flags: u32,
    /// Field name, absent when reflection names were stripped
    pub name: Option<String>,
    /// Field type, absent for payload-less enum cases
    pub type_name: Option<String>,
}

impl FieldRecord {
    /// The enum case is `indirect`
    pub const IS_INDIRECT_CASE: u32 = 1 << 0;
    /// The property is a `var`
    pub const IS_VAR: u32 = 1 << 1;
    /// The field was synthesized by the compiler
    pub const IS_ARTIFICIAL: u32 = 1 << 2;

    /// Whether the property is mutable
    pub fn is_var(&self) -> bool {
        self.flags & Self::IS_VAR != 0
    }

    /// Whether the enum case is indirect
    pub fn is_indirect_case(&self) -> bool {
        self.flags & Self::IS_INDIRECT_CASE != 0
    }

    /// Whether the field is compiler-synthesized
    pub fn is_artificial(&self) -> bool {
        self.flags & Self::IS_ARTIFICIAL != 0
    }

    fn from_record(
        record: &Record,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        Ok(Self {
            flags: record.flags("flags")?.raw() as u32,
            name: optional_name(record, "field_name", resolver, names)?,
            type_name: optional_name(record, "mangled_type_name", resolver, names)?,
        })
    }
}

/// The fields of one nominal type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Address of the descriptor
    pub address: u64,
    /// Name of the described type
    pub type_name: Option<String>,
    /// Superclass, for classes that have one
    pub superclass: Option<String>,
    /// Declaration kind
    pub kind: FieldDescriptorKind,
    /// Fields in declaration order
    pub fields: Vec<FieldRecord>,
}

impl CatalogRecord for FieldDescriptor {
    const ROLE: SectionRole = SectionRole::FieldMetadata;

    fn layout(order: ByteOrder) -> &'static Arc<LayoutSpec> {
        field_descriptor(order)
    }

    fn from_record(
        record: &Record,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        let fields = trailing_records(record, "fields")?
            .into_iter()
            .map(|field| FieldRecord::from_record(field, resolver, names))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            address: record.address(),
            type_name: optional_name(record, "mangled_type_name", resolver, names)?,
            superclass: optional_name(record, "superclass", resolver, names)?,
            kind: FieldDescriptorKind::from_raw(record.u64("kind")? as u16),
            fields,
        })
    }
}
