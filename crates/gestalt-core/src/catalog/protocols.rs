//! Protocol descriptors (`__swift5_protos`) and conformances (`__swift5_proto`).

use super::context::{context_descriptor, resolve_type_reference, TypeReferenceKind};
use super::{cached, optional_name, trailing_records, unless_external, CatalogRecord, SpecCells};
use crate::decode::{PointerValue, Record, UnionValue};
use crate::error::{Error, Result};
use crate::layout::{
    Alternative, ByteOrder, DiscriminantSource, LayoutSpec, Node, PointerKind, PointerTarget,
    ScalarKind, TrailingRepeat,
};
use crate::resolve::{NameDecoder, RelativeOffset, RelativePointerResolver};
use crate::scanner::SectionRole;
use std::sync::{Arc, OnceLock};

/// Pointer to a protocol: bit 0 marks indirection, bit 1 an Objective-C protocol
const PROTOCOL_POINTER: PointerKind = PointerKind::TagPacked {
    tag_bits: 1,
    indirectable: true,
};

const OBJC_PROTOCOL_TAG: u32 = 1;

const REQUIREMENT_KIND_MASK: u64 = 0x1F;
const REQUIREMENT_PROTOCOL: u64 = 0;
const REQUIREMENT_SAME_TYPE: u64 = 1;
const REQUIREMENT_BASE_CLASS: u64 = 2;
const REQUIREMENT_SAME_CONFORMANCE: u64 = 3;
const REQUIREMENT_SAME_SHAPE: u64 = 4;
const REQUIREMENT_LAYOUT: u64 = 0x1F;

/// Protocols whose kind-specific flag is clear only accept classes
const PROTOCOL_ANY_CONSTRAINT: u64 = 1 << 16;

const CONFORMANCE_TYPE_KIND_MASK: u64 = 0x7 << 3;
const CONFORMANCE_TYPE_KIND_SHIFT: u32 = 3;
const CONDITIONAL_COUNT_MASK: u64 = 0xFF << 8;
const CONDITIONAL_COUNT_SHIFT: u32 = 8;

/// Layout of one requirement of a generic signature
pub fn generic_requirement(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        let name = || Node::pointer(PointerKind::Direct, PointerTarget::SymbolicName);
        LayoutSpec::builder("GenericRequirementDescriptor")
            .byte_order(order)
            .flags(
                "flags",
                ScalarKind::U32,
                &[("has_key_argument", 0x80), ("has_extra_argument", 0x40)],
            )
            .pointer("param", PointerKind::Direct, PointerTarget::SymbolicName)
            .union(
                "constraint",
                DiscriminantSource::local("flags").mask(REQUIREMENT_KIND_MASK),
                vec![
                    Alternative::new(
                        REQUIREMENT_PROTOCOL,
                        "protocol",
                        Node::pointer(PROTOCOL_POINTER, PointerTarget::Opaque),
                    ),
                    Alternative::new(REQUIREMENT_SAME_TYPE, "same_type", name()),
                    Alternative::new(REQUIREMENT_BASE_CLASS, "base_class", name()),
                    Alternative::new(
                        REQUIREMENT_SAME_CONFORMANCE,
                        "same_conformance",
                        Node::pointer(PointerKind::Indirectable, PointerTarget::Opaque),
                    ),
                    Alternative::new(REQUIREMENT_SAME_SHAPE, "same_shape", name()),
                    Alternative::new(
                        REQUIREMENT_LAYOUT,
                        "layout",
                        Node::Scalar(ScalarKind::U32),
                    ),
                ],
            )
            .build()
    })
}

/// Layout of one entry of a protocol's witness table description
pub fn protocol_requirement(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("ProtocolRequirement")
            .byte_order(order)
            .flags(
                "flags",
                ScalarKind::U32,
                &[("instance", 0x10), ("async", 0x20)],
            )
            .pointer(
                "default_implementation",
                PointerKind::Direct,
                PointerTarget::Opaque,
            )
            .build()
    })
}

/// Layout of a protocol descriptor with its requirement signature and requirements
pub fn protocol_descriptor(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("ProtocolDescriptor")
            .byte_order(order)
            .nested("context", Arc::clone(context_descriptor(order)))
            .pointer("name", PointerKind::Direct, PointerTarget::CString)
            .scalar("num_requirements_in_signature", ScalarKind::U32)
            .scalar("num_requirements", ScalarKind::U32)
            .pointer(
                "associated_type_names",
                PointerKind::Direct,
                PointerTarget::CString,
            )
            .trailing(
                "requirement_signature",
                TrailingRepeat::new(
                    "num_requirements_in_signature",
                    Arc::clone(generic_requirement(order)),
                ),
            )
            .trailing(
                "requirements",
                TrailingRepeat::new("num_requirements", Arc::clone(protocol_requirement(order))),
            )
            .build()
    })
}

/// Layout of one `__swift5_protos` entry
pub fn protocol_record(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("ProtocolRecord")
            .byte_order(order)
            .pointer(
                "protocol",
                PROTOCOL_POINTER,
                PointerTarget::Layout(Arc::clone(protocol_descriptor(order))),
            )
            .build()
    })
}

/// Layout of a protocol conformance descriptor
pub fn conformance_descriptor(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("ProtocolConformanceDescriptor")
            .byte_order(order)
            .pointer("protocol", PointerKind::Indirectable, PointerTarget::Opaque)
            // reinterpreted according to the type reference kind in the flags
            .pointer("type_ref", PointerKind::Direct, PointerTarget::Opaque)
            .pointer("witness_table_pattern", PointerKind::Direct, PointerTarget::Opaque)
            .flags(
                "flags",
                ScalarKind::U32,
                &[
                    ("retroactive", 1 << 6),
                    ("synthesized_non_unique", 1 << 7),
                    ("has_resilient_witnesses", 1 << 16),
                    ("has_generic_witness_table", 1 << 17),
                ],
            )
            .build()
    })
}

/// Layout of one `__swift5_proto` entry
pub fn conformance_record(order: ByteOrder) -> &'static Arc<LayoutSpec> {
    static CELLS: SpecCells = [OnceLock::new(), OnceLock::new()];
    cached(&CELLS, order, |order| {
        LayoutSpec::builder("ProtocolConformanceRecord")
            .byte_order(order)
            .pointer(
                "descriptor",
                PointerKind::Indirectable,
                PointerTarget::Layout(Arc::clone(conformance_descriptor(order))),
            )
            .build()
    })
}

fn pointer_name(
    pointer: &PointerValue,
    resolver: &RelativePointerResolver<'_>,
    names: &dyn NameDecoder,
) -> Result<Option<String>> {
    if pointer.offset.is_null() {
        return Ok(None);
    }
    resolver.display_name(pointer, names).map(Some)
}

/// Name of the Swift protocol a protocol pointer refers to
///
/// Objective-C protocols and protocols defined in other images have no
/// descriptor here and yield `None`.
fn protocol_name(
    resolver: &RelativePointerResolver<'_>,
    offset: &RelativeOffset,
    names: &dyn NameDecoder,
) -> Result<Option<String>> {
    if offset.is_null() || offset.tag() == Some(OBJC_PROTOCOL_TAG) {
        return Ok(None);
    }
    let spec = protocol_descriptor(resolver.image().byte_order());
    match unless_external(resolver.follow_as(offset, spec))? {
        Some(record) => optional_name(&record, "name", resolver, names),
        None => Ok(None),
    }
}

/// What a generic requirement constrains its parameter to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequirementConstraint {
    /// `T: Protocol`
    Protocol {
        /// Protocol name, when its descriptor is in this image
        name: Option<String>,
        /// Whether it is an Objective-C protocol
        objc: bool,
    },
    /// `T == Type`
    SameType(Option<String>),
    /// `T: Class`
    BaseClass(Option<String>),
    /// Same-conformance requirement, by conformance address
    SameConformance(Option<u64>),
    /// Same-shape requirement between parameter packs
    SameShape(Option<String>),
    /// Layout constraint such as `AnyObject`
    Layout(u32),
}

impl RequirementConstraint {
    fn from_union(
        union: &UnionValue,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        if union.discriminant == REQUIREMENT_LAYOUT {
            let kind = union
                .value
                .as_u64()
                .ok_or_else(|| Error::unexpected_value("constraint", "a layout kind"))?;
            return Ok(Self::Layout(kind as u32));
        }

        let pointer = union
            .value
            .as_pointer()
            .ok_or_else(|| Error::unexpected_value("constraint", "a pointer"))?;
        Ok(match union.discriminant {
            REQUIREMENT_PROTOCOL => Self::Protocol {
                name: protocol_name(resolver, &pointer.offset, names)?,
                objc: pointer.offset.tag() == Some(OBJC_PROTOCOL_TAG),
            },
            REQUIREMENT_SAME_TYPE => Self::SameType(pointer_name(pointer, resolver, names)?),
            REQUIREMENT_BASE_CLASS => Self::BaseClass(pointer_name(pointer, resolver, names)?),
            REQUIREMENT_SAME_SHAPE => Self::SameShape(pointer_name(pointer, resolver, names)?),
            _ => Self::SameConformance(
                unless_external(resolver.resolve(&pointer.offset))?.map(|p| p.address),
            ),
        })
    }
}

/// One requirement of a generic signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericRequirement {
    /// The constrained parameter
    pub param: Option<String>,
    /// The constraint
    pub constraint: RequirementConstraint,
    /// Whether the requirement contributes a key argument
    pub has_key_argument: bool,
}

impl GenericRequirement {
    /// Builds the view from a decoded requirement
    pub fn from_record(
        record: &Record,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        Ok(Self {
            param: optional_name(record, "param", resolver, names)?,
            constraint: RequirementConstraint::from_union(
                record.union("constraint")?,
                resolver,
                names,
            )?,
            has_key_argument: record.flags("flags")?.contains("has_key_argument"),
        })
    }
}

/// Kind of a protocol requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolRequirementKind {
    /// An inherited protocol
    BaseProtocol,
    /// A method
    Method,
    /// An initializer
    Init,
    /// A property getter
    Getter,
    /// A property setter
    Setter,
    /// A `_read` accessor
    ReadCoroutine,
    /// A `_modify` accessor
    ModifyCoroutine,
    /// An associated type
    AssociatedTypeAccessFunction,
    /// An associated conformance
    AssociatedConformanceAccessFunction,
    /// A kind this version does not know
    Unknown(u8),
}

impl ProtocolRequirementKind {
    /// Extracts the kind from requirement flags
    pub fn from_flags(flags: u64) -> Self {
        match (flags & 0x0F) as u8 {
            0 => Self::BaseProtocol,
            1 => Self::Method,
            2 => Self::Init,
            3 => Self::Getter,
            4 => Self::Setter,
            5 => Self::ReadCoroutine,
            6 => Self::ModifyCoroutine,
            7 => Self::AssociatedTypeAccessFunction,
            8 => Self::AssociatedConformanceAccessFunction,
            other => Self::Unknown(other),
        }
    }
}

/// One requirement a conforming type must witness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolRequirement {
    /// Requirement kind
    pub kind: ProtocolRequirementKind,
    /// Instance rather than static member
    pub is_instance: bool,
    /// Whether the protocol supplies a default witness
    pub has_default_implementation: bool,
}

impl ProtocolRequirement {
    fn from_record(record: &Record) -> Result<Self> {
        let flags = record.flags("flags")?;
        Ok(Self {
            kind: ProtocolRequirementKind::from_flags(flags.raw()),
            is_instance: flags.contains("instance"),
            has_default_implementation: !record.pointer("default_implementation")?.offset.is_null(),
        })
    }
}

/// A Swift protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    /// Address of the descriptor
    pub address: u64,
    /// Protocol name
    pub name: Option<String>,
    /// Whether only classes may conform
    pub class_bound: bool,
    /// Names of the associated types, in declaration order
    pub associated_type_names: Vec<String>,
    /// Requirements on `Self` and the associated types
    pub requirement_signature: Vec<GenericRequirement>,
    /// Witness table entries
    pub requirements: Vec<ProtocolRequirement>,
}

impl ProtocolDescriptor {
    /// Builds the view from a decoded descriptor
    pub fn from_record(
        record: &Record,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        let flags = record.record("context")?.flags("flags")?;

        let associated_type_names = optional_name(record, "associated_type_names", resolver, names)?
            .map(|joined| joined.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let requirement_signature = trailing_records(record, "requirement_signature")?
            .into_iter()
            .map(|item| GenericRequirement::from_record(item, resolver, names))
            .collect::<Result<Vec<_>>>()?;

        let requirements = trailing_records(record, "requirements")?
            .into_iter()
            .map(ProtocolRequirement::from_record)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            address: record.address(),
            name: optional_name(record, "name", resolver, names)?,
            class_bound: !flags.is_set(PROTOCOL_ANY_CONSTRAINT),
            associated_type_names,
            requirement_signature,
            requirements,
        })
    }
}

/// One entry of the protocols section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolRecord {
    /// Address of the record
    pub address: u64,
    /// Whether the entry names an Objective-C protocol
    pub objc: bool,
    /// The protocol, when its descriptor is in this image
    pub descriptor: Option<ProtocolDescriptor>,
}

impl CatalogRecord for ProtocolRecord {
    const ROLE: SectionRole = SectionRole::Protocols;

    fn layout(order: ByteOrder) -> &'static Arc<LayoutSpec> {
        protocol_record(order)
    }

    fn from_record(
        record: &Record,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        let pointer = record.pointer("protocol")?;
        let objc = pointer.offset.tag() == Some(OBJC_PROTOCOL_TAG);
        let descriptor = if objc {
            None
        } else {
            match unless_external(resolver.follow(pointer))? {
                Some(body) => Some(ProtocolDescriptor::from_record(&body, resolver, names)?),
                None => None,
            }
        };
        Ok(Self {
            address: record.address(),
            objc,
            descriptor,
        })
    }
}

/// A declaration that a type conforms to a protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConformance {
    /// Address of the record
    pub address: u64,
    /// Address of the conformance descriptor
    pub descriptor_address: u64,
    /// Name of the protocol, when its descriptor is in this image
    pub protocol: Option<String>,
    /// How the conforming type is referenced
    pub type_kind: TypeReferenceKind,
    /// Name of the conforming type, when known
    pub type_name: Option<String>,
    /// Declared outside the modules of both the type and the protocol
    pub is_retroactive: bool,
    /// Number of conditional requirements
    pub conditional_requirements: u32,
    /// Whether the conformance carries resilient witnesses
    pub has_resilient_witnesses: bool,
}

impl CatalogRecord for ProtocolConformance {
    const ROLE: SectionRole = SectionRole::ProtocolConformances;

    fn layout(order: ByteOrder) -> &'static Arc<LayoutSpec> {
        conformance_record(order)
    }

    fn from_record(
        record: &Record,
        resolver: &RelativePointerResolver<'_>,
        names: &dyn NameDecoder,
    ) -> Result<Self> {
        let body = resolver.follow(record.pointer("descriptor")?)?;
        let flags = body.flags("flags")?;
        let type_kind = TypeReferenceKind::from_raw(
            flags.field(CONFORMANCE_TYPE_KIND_MASK, CONFORMANCE_TYPE_KIND_SHIFT),
        )?;

        let type_ref = body.pointer("type_ref")?;
        let referenced = unless_external(resolve_type_reference(
            resolver,
            &type_ref.offset,
            type_kind,
            names,
        ))?
        .unwrap_or_default();
        let type_name = referenced
            .descriptor
            .and_then(|descriptor| descriptor.name)
            .or(referenced.objc_name);

        Ok(Self {
            address: record.address(),
            descriptor_address: body.address(),
            protocol: protocol_name(resolver, &body.pointer("protocol")?.offset, names)?,
            type_kind,
            type_name,
            is_retroactive: flags.contains("retroactive"),
            conditional_requirements: flags.field(CONDITIONAL_COUNT_MASK, CONDITIONAL_COUNT_SHIFT)
                as u32,
            has_resilient_witnesses: flags.contains("has_resilient_witnesses"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::SectionBuilder;
    use crate::decode::{decode_record, ByteCursor};
    use crate::image::{Image, ImageId, LoadedObject};
    use crate::resolve::VerbatimNames;
    use pretty_assertions::assert_eq;

    const PROTOS: u64 = 0x1000;
    const PROTO: u64 = 0x1800;
    const CONST: u64 = 0x2000;
    const STRINGS: u64 = 0x3000;

    const SHAPE: u64 = CONST;
    const BASE: u64 = CONST + 52;
    const CONFORMANCE: u64 = CONST + 76;
    const EMPTY_SLOT: u64 = CONST + 92;

    fn constants() -> Vec<u8> {
        let mut section = SectionBuilder::new(CONST);
        // protocol Shape: Base, one requirement in signature, two requirements
        section
            .u32(3 | 0x40 | PROTOCOL_ANY_CONSTRAINT as u32)
            .u32(0)
            .rel(STRINGS)
            .u32(1)
            .u32(2)
            .rel(STRINGS + 8);
        section.u32(0x80).rel(STRINGS + 20).rel(BASE);
        section.u32(0x10 | 1).u32(0);
        section.u32(7).u32(0);
        assert_eq!(section.here(), BASE);

        // class-bound protocol Base without requirements
        section.u32(3 | 0x40).u32(0).rel(STRINGS + 24).u32(0).u32(0).u32(0);
        assert_eq!(section.here(), CONFORMANCE);

        // MyClass: Shape, retroactive, one conditional requirement
        section
            .rel(SHAPE)
            .rel(STRINGS + 32)
            .u32(0)
            .u32((2 << 3) | (1 << 6) | (1 << 8));
        section.bytes(&[0; 8]);
        section.bytes
    }

    fn image(protos: Vec<u8>, proto: Vec<u8>) -> Image {
        let object = LoadedObject::new()
            .with_section("__swift5_protos", PROTOS, protos)
            .with_section("__swift5_proto", PROTO, proto)
            .with_section("__const", CONST, constants())
            .with_section(
                "__cstring",
                STRINGS,
                b"Shape\0\0\0Unit Size\0\0\0x\0\0\0Base\0\0\0\0MyClass\0".to_vec(),
            );
        Image::from_object(ImageId::new(0), "Demo", object)
    }

    fn decode_all<T: CatalogRecord>(image: &Image, section: &str) -> Vec<T> {
        let spec = T::layout(ByteOrder::Little);
        let mut cursor = image.section(section).unwrap().cursor();
        let mut out = Vec::new();
        while !cursor.is_empty() {
            let (record, next) = decode_record(spec, cursor).unwrap();
            out.push(T::from_record(&record, &image.resolver(), &VerbatimNames).unwrap());
            cursor = next;
        }
        out
    }

    #[test]
    fn test_protocol_records() {
        let mut protos = SectionBuilder::new(PROTOS);
        protos.rel(SHAPE);
        protos.rel_tagged(BASE, 0b10);
        protos.rel_tagged(EMPTY_SLOT, 0b01);
        let image = image(protos.bytes, Vec::new());

        let records = decode_all::<ProtocolRecord>(&image, "__swift5_protos");
        assert_eq!(records.len(), 3);

        let shape = records[0].descriptor.as_ref().unwrap();
        assert_eq!(shape.name.as_deref(), Some("Shape"));
        assert!(!shape.class_bound);
        assert_eq!(shape.associated_type_names, vec!["Unit", "Size"]);
        assert_eq!(
            shape.requirement_signature,
            vec![GenericRequirement {
                param: Some("x".to_string()),
                constraint: RequirementConstraint::Protocol {
                    name: Some("Base".to_string()),
                    objc: false,
                },
                has_key_argument: true,
            }]
        );
        assert_eq!(
            shape.requirements,
            vec![
                ProtocolRequirement {
                    kind: ProtocolRequirementKind::Method,
                    is_instance: true,
                    has_default_implementation: false,
                },
                ProtocolRequirement {
                    kind: ProtocolRequirementKind::AssociatedTypeAccessFunction,
                    is_instance: false,
                    has_default_implementation: false,
                },
            ]
        );

        assert!(records[1].objc);
        assert_eq!(records[1].descriptor, None);

        // indirect through a slot bound at load time
        assert!(!records[2].objc);
        assert_eq!(records[2].descriptor, None);
    }

    #[test]
    fn test_conformance() {
        let mut proto = SectionBuilder::new(PROTO);
        proto.rel(CONFORMANCE);
        let image = image(Vec::new(), proto.bytes);

        let conformances = decode_all::<ProtocolConformance>(&image, "__swift5_proto");
        assert_eq!(
            conformances,
            vec![ProtocolConformance {
                address: PROTO,
                descriptor_address: CONFORMANCE,
                protocol: Some("Shape".to_string()),
                type_kind: TypeReferenceKind::DirectObjCClassName,
                type_name: Some("MyClass".to_string()),
                is_retroactive: true,
                conditional_requirements: 1,
                has_resilient_witnesses: false,
            }]
        );
    }

    #[test]
    fn test_layout_requirement() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x1Fu32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let (record, _) = decode_record(
            generic_requirement(ByteOrder::Little),
            ByteCursor::with_origin(&bytes, 0x4000),
        )
        .unwrap();

        let image = image(Vec::new(), Vec::new());
        let requirement =
            GenericRequirement::from_record(&record, &image.resolver(), &VerbatimNames).unwrap();
        assert_eq!(requirement.constraint, RequirementConstraint::Layout(0));
        assert_eq!(requirement.param, None);
        assert!(!requirement.has_key_argument);
    }

    #[test]
    fn test_unknown_requirement_kind() {
        let mut bytes = 9u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        let result = decode_record(
            generic_requirement(ByteOrder::Little),
            ByteCursor::with_origin(&bytes, 0x4000),
        );
        assert!(matches!(
            result,
            Err(Error::DiscriminantUnsupported { value: 9, .. })
        ));
    }

    #[test]
    fn test_requirement_kinds() {
        assert_eq!(ProtocolRequirementKind::from_flags(0x12), ProtocolRequirementKind::Init);
        assert_eq!(
            ProtocolRequirementKind::from_flags(0x0C),
            ProtocolRequirementKind::Unknown(12)
        );
    }
}
