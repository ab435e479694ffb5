//! Associated type descriptors (`__swift5_assocty`).

use super::{cached, optional_name, trailing_records, CatalogRecord, SpecCells};
use crate::decode::Record;
use crate::error::Result;
use crate::layout::{ByteOrder, LayoutSpec, PointerKind, PointerTarget, ScalarKind, TrailingRepeat};
use crate::resolve::{NameDecoder, RelativePointerResolver};
use crate::scanner::SectionRole;
use std::sync::{Arc, OnceLock};

/// Layout of one `typealias` witness
pub fn associated_type_record(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("AssociatedTypeRecord")
            .byte_order(order)
            .pointer("name", PointerKind::Direct, PointerTarget::CString)
            .pointer(
                "substituted_type_name",
                PointerKind::Direct,
                PointerTarget::SymbolicName,
            )
            .build()
    })
}

/// Layout of the associated types of one conformance
pub fn associated_type_descriptor(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("AssociatedTypeDescriptor")
            .byte_order(order)
            .pointer(
                "conforming_type_name",
                PointerKind::Direct,
                PointerTarget::SymbolicName,
            )
            .pointer(
                "protocol_type_name",
                PointerKind::Direct,
                PointerTarget::SymbolicName,
            )
            .scalar("num_associated_types", ScalarKind::U32)
            .scalar("associated_type_record_size", ScalarKind::U32)
            .trailing(
                "associated_types",
                TrailingRepeat::new(
                    "num_associated_types",
                    Arc::clone(associated_type_record(order)),
                )
                .stride("associated_type_record_size"),
            )
            .build()
    })
}

/// One `typealias Name = Type` witness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociatedType {
    /// Name of the associated type requirement
    pub name: Option<String>,
    /// Type it is bound to
    pub substituted_type_name: Option<String>,
}

/// The associated types a type provides for one protocol conformance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociatedTypeDescriptor {
    /// Address of the descriptor
    pub address: u64,
    /// The conforming type
    pub conforming_type_name: Option<String>,
    /// The protocol conformed to
    pub protocol_type_name: Option<String>,
    /// Witnesses in record order
    pub associated_types: Vec<AssociatedType>,
}

impl CatalogRecord for AssociatedTypeDescriptor {
    const ROLE: SectionRole = SectionRole::AssociatedTypes;

    fn layout(order: ByteOrder) -> &'static Arc<LayoutSpec> {
        associated_type_descriptor(order)
    }

    fn from_record(
        record: &Record,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        let associated_types = trailing_records(record, "associated_types")?
            .into_iter()
            .map(|item| {
                Ok(AssociatedType {
                    name: optional_name(item, "name", resolver, names)?,
                    substituted_type_name: optional_name(
                        item,
                        "substituted_type_name",
                        resolver,
                        names,
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            address: record.address(),
            conforming_type_name: optional_name(record, "conforming_type_name", resolver, names)?,
            protocol_type_name: optional_name(record, "protocol_type_name", resolver, names)?,
            associated_types,
        })
    }
}
