//! Decoded value trees.

use crate::error::{Error, Result};
use crate::layout::{FlagBit, PointerTarget};
use crate::resolve::RelativeOffset;
use std::sync::Arc;

/// Result of decoding a node, mirroring the spec's shape
#[derive(Debug, Clone)]
pub enum DecodedValue {
    /// Unsigned integer
    Unsigned(u64),
    /// Sign-extended integer
    Signed(i64),
    /// Flag set
    Flags(FlagSet),
    /// Nested record
    Record(Record),
    /// Selected union arm
    Union(UnionValue),
    /// Unresolved relative pointer
    Pointer(PointerValue),
    /// Trailing elements, in buffer order
    Repeat(Vec<DecodedValue>),
}

impl DecodedValue {
    /// Integer view of scalars and flag sets; negative values yield `None`
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DecodedValue::Unsigned(v) => Some(*v),
            DecodedValue::Signed(v) => u64::try_from(*v).ok(),
            DecodedValue::Flags(flags) => Some(flags.raw()),
            _ => None,
        }
    }

    /// Signed view of scalars
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DecodedValue::Signed(v) => Some(*v),
            DecodedValue::Unsigned(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Record view
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            DecodedValue::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Pointer view
    pub fn as_pointer(&self) -> Option<&PointerValue> {
        match self {
            DecodedValue::Pointer(pointer) => Some(pointer),
            _ => None,
        }
    }

    /// Flag set view
    pub fn as_flags(&self) -> Option<&FlagSet> {
        match self {
            DecodedValue::Flags(flags) => Some(flags),
            _ => None,
        }
    }

    /// Union view
    pub fn as_union(&self) -> Option<&UnionValue> {
        match self {
            DecodedValue::Union(value) => Some(value),
            _ => None,
        }
    }

    /// Trailing elements view
    pub fn as_repeat(&self) -> Option<&[DecodedValue]> {
        match self {
            DecodedValue::Repeat(items) => Some(items),
            _ => None,
        }
    }
}

/// A decoded integer together with the names of its known bits
#[derive(Debug, Clone)]
pub struct FlagSet {
    raw: u64,
    bits: Arc<[FlagBit]>,
}

impl FlagSet {
    pub(crate) fn new(raw: u64, bits: Arc<[FlagBit]>) -> Self {
        Self { raw, bits }
    }

    /// Raw integer value
    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// Whether every bit of `mask` is set
    pub fn is_set(&self, mask: u64) -> bool {
        self.raw & mask == mask
    }

    /// Whether the named flag is set; unknown names are never set
    pub fn contains(&self, name: &str) -> bool {
        self.bits
            .iter()
            .find(|bit| bit.name == name)
            .is_some_and(|bit| self.is_set(bit.mask))
    }

    /// Extracts a multi-bit field
    pub fn field(&self, mask: u64, shift: u32) -> u64 {
        (self.raw & mask) >> shift
    }

    /// Names of the known flags that are set, in declaration order
    pub fn set_names(&self) -> Vec<&str> {
        self.bits
            .iter()
            .filter(|bit| self.is_set(bit.mask))
            .map(|bit| bit.name.as_str())
            .collect()
    }
}

/// The arm a union decoded to
#[derive(Debug, Clone)]
pub struct UnionValue {
    /// Discriminant after masking
    pub discriminant: u64,
    /// Name of the selected alternative
    pub alternative: Arc<str>,
    /// Decoded payload
    pub value: Box<DecodedValue>,
}

/// A pointer field, kept unresolved until asked for
#[derive(Debug, Clone)]
pub struct PointerValue {
    /// Where the pointer lives and what it stores
    pub offset: RelativeOffset,
    /// What the pointer refers to
    pub target: PointerTarget,
}

/// A decoded record: named values in declaration order
#[derive(Debug, Clone)]
pub struct Record {
    name: Arc<str>,
    address: u64,
    size: usize,
    fields: Vec<(Arc<str>, DecodedValue)>,
}

impl Record {
    pub(crate) fn new(
        name: Arc<str>,
        address: u64,
        size: usize,
        fields: Vec<(Arc<str>, DecodedValue)>,
    ) -> Self {
        Self {
            name,
            address,
            size,
            fields,
        }
    }

    /// Name of the spec the record was decoded with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the record's first byte
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Bytes consumed, including trailing elements
    pub fn size(&self) -> usize {
        self.size
    }

    /// Fields in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DecodedValue)> {
        self.fields.iter().map(|(name, value)| (&**name, value))
    }

    /// Looks up a field by name
    pub fn get(&self, name: &str) -> Option<&DecodedValue> {
        self.fields
            .iter()
            .find(|(field, _)| &**field == name)
            .map(|(_, value)| value)
    }

    /// Looks up a field, failing with `UnknownField`
    pub fn field(&self, name: &str) -> Result<&DecodedValue> {
        self.get(name)
            .ok_or_else(|| Error::unknown_field(name, self.address))
    }

    /// Integer field
    pub fn u64(&self, name: &str) -> Result<u64> {
        self.field(name)?
            .as_u64()
            .ok_or_else(|| Error::unexpected_value(name, "a non-negative integer"))
    }

    /// Pointer field
    pub fn pointer(&self, name: &str) -> Result<&PointerValue> {
        self.field(name)?
            .as_pointer()
            .ok_or_else(|| Error::unexpected_value(name, "a relative pointer"))
    }

    /// Flag-set field
    pub fn flags(&self, name: &str) -> Result<&FlagSet> {
        self.field(name)?
            .as_flags()
            .ok_or_else(|| Error::unexpected_value(name, "a flag set"))
    }

    /// Nested record field
    pub fn record(&self, name: &str) -> Result<&Record> {
        self.field(name)?
            .as_record()
            .ok_or_else(|| Error::unexpected_value(name, "a nested record"))
    }

    /// Union field
    pub fn union(&self, name: &str) -> Result<&UnionValue> {
        self.field(name)?
            .as_union()
            .ok_or_else(|| Error::unexpected_value(name, "a union"))
    }

    /// Trailing block field
    pub fn repeat(&self, name: &str) -> Result<&[DecodedValue]> {
        self.field(name)?
            .as_repeat()
            .ok_or_else(|| Error::unexpected_value(name, "trailing elements"))
    }
}
