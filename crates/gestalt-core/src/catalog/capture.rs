//! Closure capture descriptors (`__swift5_capture`).

use super::{cached, optional_name, trailing_records, CatalogRecord, SpecCells};
use crate::decode::Record;
use crate::error::Result;
use crate::layout::{ByteOrder, LayoutSpec, PointerKind, PointerTarget, ScalarKind, TrailingRepeat};
use crate::resolve::{NameDecoder, RelativePointerResolver};
use crate::scanner::SectionRole;
use std::sync::{Arc, OnceLock};

fn capture_type_record(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("CaptureTypeRecord")
            .byte_order(order)
            .pointer(
                "mangled_type_name",
                PointerKind::Direct,
                PointerTarget::SymbolicName,
            )
            .build()
    })
}

fn metadata_source_record(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("MetadataSourceRecord")
            .byte_order(order)
            .pointer(
                "mangled_type_name",
                PointerKind::Direct,
                PointerTarget::SymbolicName,
            )
            .pointer(
                "mangled_metadata_source",
                PointerKind::Direct,
                PointerTarget::SymbolicName,
            )
            .build()
    })
}

/// Layout of a closure context: capture types, then metadata sources
pub fn capture_descriptor(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("CaptureDescriptor")
            .byte_order(order)
            .scalar("num_capture_types", ScalarKind::U32)
            .scalar("num_metadata_sources", ScalarKind::U32)
            .scalar("num_bindings", ScalarKind::U32)
            .trailing(
                "capture_types",
                TrailingRepeat::new("num_capture_types", Arc::clone(capture_type_record(order))),
            )
            .trailing(
                "metadata_sources",
                TrailingRepeat::new(
                    "num_metadata_sources",
                    Arc::clone(metadata_source_record(order)),
                ),
            )
            .build()
    })
}

/// Where the metadata for a generic parameter of a closure comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSource {
    /// The parameter's type
    pub type_name: Option<String>,
    /// Encoded path to the metadata
    pub source: Option<String>,
}

/// The captured values of a closure context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDescriptor {
    /// Address of the descriptor
    pub address: u64,
    /// Types of the captured values, in order
    pub capture_types: Vec<Option<String>>,
    /// Metadata sources, in order
    pub metadata_sources: Vec<MetadataSource>,
    /// Number of necessary bindings
    pub num_bindings: u32,
}

impl CatalogRecord for CaptureDescriptor {
    const ROLE: SectionRole = SectionRole::Captures;

    fn layout(order: ByteOrder) -> &'static Arc<LayoutSpec> {
        capture_descriptor(order)
    }

    fn from_record(
        record: &Record,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        let capture_types = trailing_records(record, "capture_types")?
            .into_iter()
            .map(|item| optional_name(item, "mangled_type_name", resolver, names))
            .collect::<Result<Vec<_>>>()?;

        let metadata_sources = trailing_records(record, "metadata_sources")?
            .into_iter()
            .map(|item| {
                Ok(MetadataSource {
                    type_name: optional_name(item, "mangled_type_name", resolver, names)?,
                    source: optional_name(item, "mangled_metadata_source", resolver, names)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            address: record.address(),
            capture_types,
            metadata_sources,
            num_bindings: record.u64("num_bindings")? as u32,
        })
    }
}
