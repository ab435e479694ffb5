//! Context descriptors and type references (`__swift5_types`).

use super::fields::{field_descriptor, FieldDescriptor};
use super::{cached, optional_name, CatalogRecord, SpecCells};
use crate::decode::{decode_record, Record};
use crate::error::{Error, Result};
use crate::layout::{ByteOrder, LayoutSpec, PointerKind, PointerTarget, ScalarKind};
use crate::resolve::{NameDecoder, RelativeOffset, RelativePointerResolver};
use crate::scanner::SectionRole;
use std::sync::{Arc, OnceLock};
use tracing::trace;

const KIND_MASK: u64 = 0x1F;

/// Layout of the header every context descriptor starts with
pub fn context_descriptor(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("ContextDescriptor")
            .byte_order(order)
            .flags(
                "flags",
                ScalarKind::U32,
                &[("unique", 0x40), ("generic", 0x80)],
            )
            .pointer("parent", PointerKind::Indirectable, PointerTarget::Opaque)
            .build()
    })
}

/// Layout of a class, struct or enum descriptor, up to its field pointer
pub fn type_context_descriptor(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("TypeContextDescriptor")
            .byte_order(order)
            .nested("context", Arc::clone(context_descriptor(order)))
            .pointer("name", PointerKind::Direct, PointerTarget::CString)
            .pointer("access_function", PointerKind::Direct, PointerTarget::Opaque)
            .pointer(
                "fields",
                PointerKind::Direct,
                PointerTarget::Layout(Arc::clone(field_descriptor(order))),
            )
            .build()
    })
}

/// Layout of one `__swift5_types` entry
pub fn type_reference_record(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("TypeMetadataRecord")
            .byte_order(order)
            .pointer(
                "descriptor",
                PointerKind::TagPacked {
                    tag_bits: 2,
                    indirectable: false,
                },
                PointerTarget::Opaque,
            )
            .build()
    })
}

/// Kind of a context descriptor, from the low bits of its flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextDescriptorKind {
    /// A module
    Module,
    /// An extension
    Extension,
    /// An anonymous context
    Anonymous,
    /// A protocol
    Protocol,
    /// An opaque result type
    OpaqueType,
    /// A class
    Class,
    /// A struct
    Struct,
    /// An enum
    Enum,
    /// A kind this version does not know
    Unknown(u8),
}

impl ContextDescriptorKind {
    /// Extracts the kind from context descriptor flags
    pub fn from_flags(flags: u64) -> Self {
        match (flags & KIND_MASK) as u8 {
            0 => Self::Module,
            1 => Self::Extension,
            2 => Self::Anonymous,
            3 => Self::Protocol,
            4 => Self::OpaqueType,
            16 => Self::Class,
            17 => Self::Struct,
            18 => Self::Enum,
            other => Self::Unknown(other),
        }
    }

    /// Whether the context is a nominal type
    pub fn is_type(self) -> bool {
        matches!(self, Self::Class | Self::Struct | Self::Enum)
    }
}

/// How a conformance or type record refers to its type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeReferenceKind {
    /// Relative pointer to a type descriptor
    DirectTypeDescriptor,
    /// Relative pointer to a pointer to a type descriptor
    IndirectTypeDescriptor,
    /// Relative pointer to an Objective-C class name
    DirectObjCClassName,
    /// Relative pointer to a pointer to an Objective-C class
    IndirectObjCClass,
}

impl TypeReferenceKind {
    /// Interprets a stored kind
    pub fn from_raw(raw: u64) -> Result<Self> {
        match raw {
            0 => Ok(Self::DirectTypeDescriptor),
            1 => Ok(Self::IndirectTypeDescriptor),
            2 => Ok(Self::DirectObjCClassName),
            3 => Ok(Self::IndirectObjCClass),
            _ => Err(Error::unexpected_value("type reference kind", "a value below 4")),
        }
    }
}

/// A class, struct or enum descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeContextDescriptor {
    /// Address of the descriptor
    pub address: u64,
    /// Context kind
    pub kind: ContextDescriptorKind,
    /// Unqualified type name
    pub name: Option<String>,
    /// Whether the type has generic parameters
    pub is_generic: bool,
    /// Address of the type's field descriptor, if it has one
    pub fields: Option<u64>,
}

impl TypeContextDescriptor {
    /// Decodes the descriptor at `address`
    pub fn read(
        resolver: &RelativePointerResolver<'_>,
        address: u64,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        let order = resolver.image().byte_order();
        let cursor = resolver.cursor_at(address)?;
        let (record, _) = decode_record(type_context_descriptor(order), cursor)?;
        Self::from_record(&record, resolver, names)
    }

    /// Builds the view from a decoded descriptor
    pub fn from_record(
        record: &Record,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        let flags = record.record("context")?.flags("flags")?;
        let kind = ContextDescriptorKind::from_flags(flags.raw());

        // Only nominal types continue with an access function and fields.
        let fields = if kind.is_type() {
            let pointer = record.pointer("fields")?;
            if pointer.offset.is_null() {
                None
            } else {
                Some(resolver.resolve(&pointer.offset)?.address)
            }
        } else {
            None
        };

        Ok(Self {
            address: record.address(),
            kind,
            name: optional_name(record, "name", resolver, names)?,
            is_generic: flags.contains("generic"),
            fields,
        })
    }

    /// Decodes the type's field descriptor
    pub fn field_descriptor(
        &self,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Option<FieldDescriptor>> {
        let Some(address) = self.fields else {
            return Ok(None);
        };
        let order = resolver.image().byte_order();
        let cursor = resolver.cursor_at(address)?;
        let (record, _) = decode_record(field_descriptor(order), cursor)?;
        FieldDescriptor::from_record(&record, resolver, names).map(Some)
    }
}

/// What a type reference points at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ReferencedType {
    pub(crate) descriptor: Option<TypeContextDescriptor>,
    pub(crate) objc_name: Option<String>,
}

/// Follows a type reference of the given kind stored at `offset`
///
/// Indirect references that point outside the image are bound at load time
/// and yield nothing.
pub(crate) fn resolve_type_reference(
    resolver: &RelativePointerResolver<'_>,
    offset: &RelativeOffset,
    kind: TypeReferenceKind,
    names: &dyn NameDecoder,
) -> Result<ReferencedType> {
    let field = offset.field_address();
    match kind {
        TypeReferenceKind::DirectTypeDescriptor => {
            let target = resolver.resolve(offset)?;
            Ok(ReferencedType {
                descriptor: Some(TypeContextDescriptor::read(resolver, target.address, names)?),
                objc_name: None,
            })
        }
        TypeReferenceKind::IndirectTypeDescriptor => {
            let slot = RelativeOffset::new(field, offset.delta() | 1, PointerKind::Indirectable);
            let target = resolver.resolve(&slot)?;
            if resolver.image().section_containing(target.address).is_none() {
                trace!("Type reference at {:#x} is bound at load time", field);
                return Ok(ReferencedType::default());
            }
            Ok(ReferencedType {
                descriptor: Some(TypeContextDescriptor::read(resolver, target.address, names)?),
                objc_name: None,
            })
        }
        TypeReferenceKind::DirectObjCClassName => {
            let target = resolver.resolve(offset)?;
            let name = resolver.c_string_at(target.address)?;
            Ok(ReferencedType {
                descriptor: None,
                objc_name: Some(String::from_utf8_lossy(name).into_owned()),
            })
        }
        TypeReferenceKind::IndirectObjCClass => Ok(ReferencedType::default()),
    }
}

/// One entry of the type metadata records section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeReference {
    /// Address of the record
    pub address: u64,
    /// How the type is referenced
    pub kind: TypeReferenceKind,
    /// The referenced descriptor, when it lives in this image
    pub descriptor: Option<TypeContextDescriptor>,
    /// Class name, for Objective-C references
    pub objc_name: Option<String>,
}

impl TypeReference {
    /// Name of the referenced type, if known
    pub fn name(&self) -> Option<&str> {
        self.descriptor
            .as_ref()
            .and_then(|descriptor| descriptor.name.as_deref())
            .or(self.objc_name.as_deref())
    }
}

impl CatalogRecord for TypeReference {
    const ROLE: SectionRole = SectionRole::TypeReferences;

    fn layout(order: ByteOrder) -> &'static Arc<LayoutSpec> {
        type_reference_record(order)
    }

    fn from_record(
        record: &Record,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        let pointer = record.pointer("descriptor")?;
        let kind = TypeReferenceKind::from_raw(u64::from(pointer.offset.tag().unwrap_or(0)))?;
        let direct = RelativeOffset::new(
            pointer.offset.field_address(),
            pointer.offset.delta(),
            PointerKind::Direct,
        );
        let referenced = resolve_type_reference(resolver, &direct, kind, names)?;
        Ok(Self {
            address: record.address(),
            kind,
            descriptor: referenced.descriptor,
            objc_name: referenced.objc_name,
        })
    }
}
