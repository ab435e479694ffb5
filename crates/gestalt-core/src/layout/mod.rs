//! Declarative descriptions of fixed-format binary records.
//!
//! A [`LayoutSpec`] is an ordered list of named [`Field`]s, each described by
//! a [`Node`]. Specs are plain data: they are built once through
//! [`LayoutSpec::builder`], validated, and then shared immutably (usually
//! behind an [`Arc`]) by every decode call.
//!
//! ## Node kinds
//!
//! - [`Node::Scalar`]: a fixed-width integer
//! - [`Node::FlagSet`]: an integer interpreted as a set of named bits
//! - [`Node::Union`]: alternatives selected by a discriminant read earlier
//! - [`Node::Nested`]: an embedded sub-record
//! - [`Node::Pointer`]: a 32-bit self-relative pointer
//! - [`Node::Trailing`]: repeated elements following the fixed header
//!
//! ## Example
//!
//! ```
//! use gestalt_core::layout::{LayoutSpec, ScalarKind, TrailingRepeat};
//! use std::sync::Arc;
//!
//! let element = Arc::new(
//!     LayoutSpec::builder("Element")
//!         .scalar("value", ScalarKind::U16)
//!         .build()?,
//! );
//! let spec = LayoutSpec::builder("Table")
//!     .scalar("count", ScalarKind::U32)
//!     .trailing("elements", TrailingRepeat::new("count", element))
//!     .build()?;
//!
//! assert_eq!(spec.fixed_size(), 4);
//! # Ok::<(), gestalt_core::Error>(())
//! ```

mod builder;

use std::sync::Arc;

pub use builder::LayoutBuilder;

/// Size in bytes of every self-relative pointer field
pub const RELATIVE_POINTER_SIZE: usize = 4;

/// Most low bits a tag-packed pointer may reserve, indirection bit included
pub const MAX_POINTER_LOW_BITS: u32 = 30;

/// Mask with the low `count` bits set
pub(crate) fn low_bits(count: u32) -> u32 {
    1u32.checked_shl(count).map_or(u32::MAX, |bit| bit - 1)
}

/// Byte order used to interpret multi-byte integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Least significant byte first
    #[default]
    Little,
    /// Most significant byte first
    Big,
}

impl ByteOrder {
    /// Assembles up to eight bytes into an unsigned integer
    pub fn read_uint(self, bytes: &[u8]) -> u64 {
        debug_assert!(bytes.len() <= 8);
        match self {
            ByteOrder::Little => bytes
                .iter()
                .rev()
                .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
            ByteOrder::Big => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
        }
    }
}

/// Width and signedness of an integer field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    /// Unsigned 8-bit
    U8,
    /// Unsigned 16-bit
    U16,
    /// Unsigned 32-bit
    U32,
    /// Unsigned 64-bit
    U64,
    /// Signed 8-bit
    I8,
    /// Signed 16-bit
    I16,
    /// Signed 32-bit
    I32,
    /// Signed 64-bit
    I64,
}

impl ScalarKind {
    /// Width of the scalar in bytes
    pub fn width(self) -> usize {
        match self {
            ScalarKind::U8 | ScalarKind::I8 => 1,
            ScalarKind::U16 | ScalarKind::I16 => 2,
            ScalarKind::U32 | ScalarKind::I32 => 4,
            ScalarKind::U64 | ScalarKind::I64 => 8,
        }
    }

    /// Whether the scalar is sign-extended when decoded
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ScalarKind::I8 | ScalarKind::I16 | ScalarKind::I32 | ScalarKind::I64
        )
    }
}

/// A named bit (or multi-bit mask) within a flag set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagBit {
    /// Display name of the flag
    pub name: String,
    /// Mask selecting the flag's bits
    pub mask: u64,
}

impl FlagBit {
    /// Creates a new named flag
    pub fn new(name: impl Into<String>, mask: u64) -> Self {
        Self {
            name: name.into(),
            mask,
        }
    }
}

/// Description of a flag-set field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagSetSpec {
    /// Underlying integer
    pub kind: ScalarKind,
    /// Known flags, in declaration order
    pub bits: Arc<[FlagBit]>,
}

/// How a self-relative pointer encodes its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    /// `field + delta` is the target
    Direct,
    /// Low bit set means the target holds an absolute pointer to follow
    Indirectable,
    /// A small integer tag lives in the low bits alongside the delta
    TagPacked {
        /// Number of tag bits
        tag_bits: u8,
        /// Whether bit 0 is an indirection flag below the tag
        indirectable: bool,
    },
}

impl PointerKind {
    /// Mask of the low bits that are not part of the delta
    pub fn low_mask(self) -> i32 {
        match self {
            PointerKind::Direct => 0,
            PointerKind::Indirectable => 1,
            PointerKind::TagPacked {
                tag_bits,
                indirectable,
            } => low_bits(u32::from(tag_bits) + u32::from(indirectable)) as i32,
        }
    }

    /// Whether bit 0 signals an extra dereference
    pub fn is_indirectable(self) -> bool {
        matches!(
            self,
            PointerKind::Indirectable
                | PointerKind::TagPacked {
                    indirectable: true,
                    ..
                }
        )
    }
}

/// What a relative pointer refers to
#[derive(Debug, Clone)]
pub enum PointerTarget {
    /// Another record described by a spec
    Layout(Arc<LayoutSpec>),
    /// A NUL-terminated byte string
    CString,
    /// A mangled name run that may embed symbolic references
    SymbolicName,
    /// Code or data with no layout (function pointers, witness tables)
    Opaque,
}

/// Scope in which a discriminant field is looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// An earlier field of the same record
    Local,
    /// A field of an enclosing record
    Enclosing,
}

/// Where a union reads the value that selects its alternative
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscriminantSource {
    /// Name of the source field
    pub field: String,
    /// Lookup scope
    pub scope: Scope,
    /// Bits of the source value to keep
    pub mask: u64,
    /// Right shift applied after masking
    pub shift: u32,
}

impl DiscriminantSource {
    /// Discriminant read from an earlier field of the same record
    pub fn local(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            scope: Scope::Local,
            mask: u64::MAX,
            shift: 0,
        }
    }

    /// Discriminant read from a field of an enclosing record
    pub fn enclosing(field: impl Into<String>) -> Self {
        Self {
            scope: Scope::Enclosing,
            ..Self::local(field)
        }
    }

    /// Keeps only the masked bits of the source value
    pub fn mask(mut self, mask: u64) -> Self {
        self.mask = mask;
        self
    }

    /// Shifts the masked value right
    pub fn shift(mut self, shift: u32) -> Self {
        self.shift = shift;
        self
    }

    /// Extracts the discriminant from a raw source value
    pub fn extract(&self, raw: u64) -> u64 {
        (raw & self.mask) >> self.shift
    }
}

/// One arm of a union
#[derive(Debug, Clone)]
pub struct Alternative {
    /// Discriminant value selecting this arm
    pub value: u64,
    /// Display name of the arm
    pub name: Arc<str>,
    /// Layout of the arm's payload
    pub node: Node,
}

impl Alternative {
    /// Creates a new union arm
    pub fn new(value: u64, name: &str, node: Node) -> Self {
        Self {
            value,
            name: Arc::from(name),
            node,
        }
    }
}

/// Repeated elements sized by header fields
#[derive(Debug, Clone)]
pub struct TrailingRepeat {
    /// Header field holding the element count
    pub count: String,
    /// Header field holding the distance between elements, if any
    pub stride: Option<String>,
    /// Layout of one element
    pub element: Arc<LayoutSpec>,
}

impl TrailingRepeat {
    /// `count` elements packed back to back
    pub fn new(count: impl Into<String>, element: Arc<LayoutSpec>) -> Self {
        Self {
            count: count.into(),
            stride: None,
            element,
        }
    }

    /// Places elements `stride` bytes apart, read from the named header field
    pub fn stride(mut self, field: impl Into<String>) -> Self {
        self.stride = Some(field.into());
        self
    }
}

/// A field descriptor node
#[derive(Debug, Clone)]
pub enum Node {
    /// Fixed-width integer
    Scalar(ScalarKind),
    /// Integer interpreted as named bits
    FlagSet(FlagSetSpec),
    /// Externally discriminated union
    Union {
        /// Source of the discriminant
        discriminant: DiscriminantSource,
        /// Possible payloads
        alternatives: Vec<Alternative>,
    },
    /// Embedded record
    Nested(Arc<LayoutSpec>),
    /// 32-bit self-relative pointer
    Pointer {
        /// Encoding of the pointer
        kind: PointerKind,
        /// What the pointer refers to
        target: PointerTarget,
    },
    /// Trailing repeated elements
    Trailing(TrailingRepeat),
}

impl Node {
    /// Shorthand for a relative pointer node
    pub fn pointer(kind: PointerKind, target: PointerTarget) -> Self {
        Node::Pointer { kind, target }
    }

    /// Bytes this node occupies in the fixed part of a record
    pub fn fixed_size(&self) -> usize {
        match self {
            Node::Scalar(kind) => kind.width(),
            Node::FlagSet(flags) => flags.kind.width(),
            Node::Union { alternatives, .. } => alternatives
                .iter()
                .map(|alt| alt.node.fixed_size())
                .max()
                .unwrap_or(0),
            Node::Nested(spec) => spec.fixed_size(),
            Node::Pointer { .. } => RELATIVE_POINTER_SIZE,
            Node::Trailing(_) => 0,
        }
    }

    /// Whether decoding the node selects a union arm, here or in a nested record
    pub fn has_union(&self) -> bool {
        match self {
            Node::Union { .. } => true,
            Node::Nested(spec) => spec.fields().iter().any(|f| f.node.has_union()),
            _ => false,
        }
    }

    /// Whether the node's size depends on decoded header values
    pub fn is_variable(&self) -> bool {
        match self {
            Node::Trailing(_) => true,
            Node::Nested(spec) => spec.has_trailing(),
            Node::Union { alternatives, .. } => alternatives.iter().any(|alt| alt.node.is_variable()),
            _ => false,
        }
    }
}

/// A named field of a record
#[derive(Debug, Clone)]
pub struct Field {
    /// Field name, unique within its spec
    pub name: Arc<str>,
    /// Field layout
    pub node: Node,
}

/// Immutable description of a record's layout
#[derive(Debug, Clone)]
pub struct LayoutSpec {
    name: Arc<str>,
    byte_order: ByteOrder,
    fields: Vec<Field>,
    fixed_size: usize,
}

impl LayoutSpec {
    /// Starts building a spec with the given display name
    pub fn builder(name: impl Into<String>) -> LayoutBuilder {
        LayoutBuilder::new(name)
    }

    pub(crate) fn from_parts(name: String, byte_order: ByteOrder, fields: Vec<Field>) -> Self {
        let fixed_size = fields.iter().map(|f| f.node.fixed_size()).sum();
        Self {
            name: Arc::from(name),
            byte_order,
            fields,
            fixed_size,
        }
    }

    /// Display name of the record
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Byte order of the record's integers
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Fields in declaration order
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Looks up a field by name
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| &*f.name == name)
    }

    /// Size of the fixed header, excluding trailing elements
    pub fn fixed_size(&self) -> usize {
        self.fixed_size
    }

    /// Whether the spec ends in one or more trailing blocks
    pub fn has_trailing(&self) -> bool {
        self.fields.iter().any(|f| matches!(f.node, Node::Trailing(_)))
    }
}
