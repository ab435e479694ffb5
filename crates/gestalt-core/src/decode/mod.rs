//! Decoding bytes against layout specs.
//!
//! [`decode`] and [`decode_at`] interpret a [`LayoutSpec`] over a
//! [`ByteCursor`]. The interpreter is a single recursive function dispatching
//! on [`Node`] kind; it is pure, so the same spec and bytes always produce the
//! same value and it can run on any number of threads at once.
//!
//! ## Guarantees
//!
//! - each run of fixed fields up to the next union is bounds-checked before
//!   its first field is read, so a short buffer fails with `BufferTooShort`
//!   and no partially decoded record is ever returned
//! - trailing counts and strides come from the record's own header, already
//!   decoded when the trailing block is reached
//! - a union whose discriminant matches no arm fails before its payload is
//!   touched, even when the payload lies past the end of the buffer
//! - pointer fields are returned unresolved, see [`crate::resolve`]
//!
//! [`ByteReader`] builds typed decoders on top of the interpreter by
//! sequencing and mapping.

mod cursor;
mod reader;
mod value;

use crate::error::{Error, Result};
use crate::layout::{
    Alternative, DiscriminantSource, Field, LayoutSpec, Node, Scope, TrailingRepeat,
};
use crate::resolve::RelativeOffset;
use std::sync::Arc;
use tracing::trace;

pub use cursor::ByteCursor;
pub use reader::ByteReader;
pub use value::{DecodedValue, FlagSet, PointerValue, Record, UnionValue};

/// Decodes one record from the start of `buffer`
pub fn decode(spec: &LayoutSpec, buffer: &[u8]) -> Result<DecodedValue> {
    let (record, _) = decode_record(spec, ByteCursor::new(buffer))?;
    Ok(DecodedValue::Record(record))
}

/// Decodes one record at `cursor`, returning it with the cursor after it
pub fn decode_at<'a>(
    spec: &LayoutSpec,
    cursor: ByteCursor<'a>,
) -> Result<(DecodedValue, ByteCursor<'a>)> {
    let (record, next) = decode_record(spec, cursor)?;
    Ok((DecodedValue::Record(record), next))
}

/// Decodes one record at `cursor` without wrapping it in a [`DecodedValue`]
pub fn decode_record<'a>(
    spec: &LayoutSpec,
    cursor: ByteCursor<'a>,
) -> Result<(Record, ByteCursor<'a>)> {
    decode_fields(spec, cursor, None)
}

/// Fields decoded so far in one record, linked to the enclosing record
struct Frame<'p> {
    fields: &'p [(Arc<str>, DecodedValue)],
    parent: Option<&'p Frame<'p>>,
}

impl Frame<'_> {
    fn local(&self, name: &str) -> Option<&DecodedValue> {
        self.fields
            .iter()
            .find(|(field, _)| &**field == name)
            .map(|(_, value)| value)
    }

    fn enclosing(&self, name: &str) -> Option<&DecodedValue> {
        let mut frame = self.parent;
        while let Some(current) = frame {
            if let Some(value) = current.local(name) {
                return Some(value);
            }
            frame = current.parent;
        }
        None
    }

    fn integer(&self, name: &str, scope: Scope, offset: u64) -> Result<u64> {
        let value = match scope {
            Scope::Local => self.local(name),
            Scope::Enclosing => self.enclosing(name),
        };
        // signed sources select by their two's-complement bits
        value
            .and_then(|value| match value {
                DecodedValue::Signed(v) => Some(*v as u64),
                other => other.as_u64(),
            })
            .ok_or_else(|| Error::unknown_field(name, offset))
    }
}

/// Size and length of the leading run of fields that select no union arm
fn fixed_run(fields: &[Field]) -> (usize, usize) {
    fields
        .iter()
        .take_while(|field| !field.node.has_union())
        .fold((0, 0), |(size, count), field| {
            (size + field.node.fixed_size(), count + 1)
        })
}

fn decode_fields<'a>(
    spec: &LayoutSpec,
    cursor: ByteCursor<'a>,
    parent: Option<&Frame<'_>>,
) -> Result<(Record, ByteCursor<'a>)> {
    let mut fields: Vec<(Arc<str>, DecodedValue)> = Vec::with_capacity(spec.fields().len());
    let mut position = cursor;
    let mut checked = 0;
    for (index, field) in spec.fields().iter().enumerate() {
        if checked == 0 {
            let (size, count) = fixed_run(&spec.fields()[index..]);
            position.ensure(size)?;
            checked = count;
        }
        let (value, next) = {
            let frame = Frame {
                fields: &fields,
                parent,
            };
            decode_node(spec, &field.name, &field.node, position, &frame)?
        };
        fields.push((Arc::clone(&field.name), value));
        position = next;
        checked = checked.saturating_sub(1);
    }

    let size = position.position() - cursor.position();
    trace!(
        "Decoded {} at {:#x} ({} bytes)",
        spec.name(),
        cursor.address(),
        size
    );
    Ok((
        Record::new(spec.name_arc(), cursor.address(), size, fields),
        position,
    ))
}

fn decode_node<'a>(
    spec: &LayoutSpec,
    name: &str,
    node: &Node,
    cursor: ByteCursor<'a>,
    frame: &Frame<'_>,
) -> Result<(DecodedValue, ByteCursor<'a>)> {
    let order = spec.byte_order();
    match node {
        Node::Scalar(kind) => {
            let (raw, next) = cursor.read_scalar(*kind, order)?;
            let value = if kind.is_signed() {
                DecodedValue::Signed(raw as i64)
            } else {
                DecodedValue::Unsigned(raw)
            };
            Ok((value, next))
        }
        Node::FlagSet(flags) => {
            let (raw, next) = cursor.read_uint(flags.kind.width(), order)?;
            Ok((
                DecodedValue::Flags(FlagSet::new(raw, Arc::clone(&flags.bits))),
                next,
            ))
        }
        Node::Nested(sub) => {
            let (value, next) = decode_fields(sub, cursor, Some(frame))?;
            Ok((DecodedValue::Record(value), next))
        }
        Node::Pointer { kind, target } => {
            let address = cursor.address();
            let (raw, next) = cursor.read_i32(order)?;
            Ok((
                DecodedValue::Pointer(PointerValue {
                    offset: RelativeOffset::new(address, raw, *kind),
                    target: target.clone(),
                }),
                next,
            ))
        }
        Node::Union {
            discriminant,
            alternatives,
        } => decode_union(
            spec,
            name,
            discriminant,
            alternatives,
            node.fixed_size(),
            cursor,
            frame,
        ),
        Node::Trailing(repeat) => decode_trailing(name, repeat, cursor, frame),
    }
}

fn decode_union<'a>(
    spec: &LayoutSpec,
    name: &str,
    discriminant: &DiscriminantSource,
    alternatives: &[Alternative],
    width: usize,
    cursor: ByteCursor<'a>,
    frame: &Frame<'_>,
) -> Result<(DecodedValue, ByteCursor<'a>)> {
    let raw = frame.integer(&discriminant.field, discriminant.scope, cursor.address())?;
    let selector = discriminant.extract(raw);
    let alternative = alternatives
        .iter()
        .find(|alt| alt.value == selector)
        .ok_or_else(|| Error::discriminant_unsupported(name, selector, cursor.address()))?;

    cursor.ensure(width)?;
    let (value, _) = decode_node(spec, &alternative.name, &alternative.node, cursor, frame)?;
    Ok((
        DecodedValue::Union(UnionValue {
            discriminant: selector,
            alternative: Arc::clone(&alternative.name),
            value: Box::new(value),
        }),
        cursor.advance(width)?,
    ))
}

fn decode_trailing<'a>(
    name: &str,
    repeat: &TrailingRepeat,
    cursor: ByteCursor<'a>,
    frame: &Frame<'_>,
) -> Result<(DecodedValue, ByteCursor<'a>)> {
    let count = frame.integer(&repeat.count, Scope::Local, cursor.address())?;
    let element_size = repeat.element.fixed_size();

    let stride = match &repeat.stride {
        Some(field) => {
            let stride = frame.integer(field, Scope::Local, cursor.address())?;
            if count > 0 && stride < element_size as u64 {
                return Err(Error::InvalidStride {
                    stride,
                    element_size,
                    offset: cursor.address(),
                });
            }
            Some(stride)
        }
        None => None,
    };

    let minimum = count
        .checked_mul(stride.unwrap_or(element_size as u64))
        .and_then(|total| usize::try_from(total).ok())
        .unwrap_or(usize::MAX);
    cursor.ensure(minimum)?;

    trace!(
        "Decoding {} x {} for '{}' at {:#x}",
        count,
        repeat.element.name(),
        name,
        cursor.address()
    );

    let count = count as usize;
    let mut items = Vec::with_capacity(count);
    match stride {
        Some(stride) => {
            let stride = stride as usize;
            for index in 0..count {
                let at = cursor.advance(index * stride)?;
                let (item, _) = decode_fields(&repeat.element, at, Some(frame))?;
                items.push(DecodedValue::Record(item));
            }
            Ok((DecodedValue::Repeat(items), cursor.advance(minimum)?))
        }
        None => {
            let mut position = cursor;
            for _ in 0..count {
                let (item, next) = decode_fields(&repeat.element, position, Some(frame))?;
                items.push(DecodedValue::Record(item));
                position = next;
            }
            Ok((DecodedValue::Repeat(items), position))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{ByteOrder, PointerKind, PointerTarget, ScalarKind};
    use pretty_assertions::assert_eq;

    fn element() -> Arc<LayoutSpec> {
        Arc::new(
            LayoutSpec::builder("Element")
                .scalar("value", ScalarKind::U16)
                .scalar("tag", ScalarKind::U16)
                .build()
                .unwrap(),
        )
    }

    fn counted() -> LayoutSpec {
        LayoutSpec::builder("Counted")
            .scalar("count", ScalarKind::U32)
            .trailing("items", TrailingRepeat::new("count", element()))
            .build()
            .unwrap()
    }

    fn values(record: &Record) -> Vec<u64> {
        record
            .repeat("items")
            .unwrap()
            .iter()
            .map(|item| item.as_record().unwrap().u64("value").unwrap())
            .collect()
    }

    #[test]
    fn test_scalar_round_trip_all_widths() {
        let kinds = [
            (ScalarKind::U8, vec![0u64, 1, 0x7F, 0xFF]),
            (ScalarKind::U16, vec![0, 0x1234, 0xFFFF]),
            (ScalarKind::U32, vec![0, 0xDEAD_BEEF, u32::MAX as u64]),
            (ScalarKind::U64, vec![0, 1 << 63, u64::MAX]),
        ];
        for order in [ByteOrder::Little, ByteOrder::Big] {
            for (kind, samples) in &kinds {
                let spec = LayoutSpec::builder("Scalar")
                    .byte_order(order)
                    .scalar("x", *kind)
                    .build()
                    .unwrap();
                for &sample in samples {
                    let width = kind.width();
                    let bytes = match order {
                        ByteOrder::Little => sample.to_le_bytes()[..width].to_vec(),
                        ByteOrder::Big => sample.to_be_bytes()[8 - width..].to_vec(),
                    };
                    let value = decode(&spec, &bytes).unwrap();
                    assert_eq!(value.as_record().unwrap().u64("x").unwrap(), sample);
                }
            }
        }
    }

    #[test]
    fn test_signed_round_trip_all_widths() {
        let kinds = [
            (ScalarKind::I8, i8::MIN as i64, i8::MAX as i64),
            (ScalarKind::I16, i16::MIN as i64, i16::MAX as i64),
            (ScalarKind::I32, i32::MIN as i64, i32::MAX as i64),
            (ScalarKind::I64, i64::MIN, i64::MAX),
        ];
        for order in [ByteOrder::Little, ByteOrder::Big] {
            for (kind, min, max) in kinds {
                let spec = LayoutSpec::builder("Signed")
                    .byte_order(order)
                    .scalar("x", kind)
                    .build()
                    .unwrap();
                for sample in [min, -1, 0, 1, max] {
                    let width = kind.width();
                    let bytes = match order {
                        ByteOrder::Little => sample.to_le_bytes()[..width].to_vec(),
                        ByteOrder::Big => sample.to_be_bytes()[8 - width..].to_vec(),
                    };
                    let value = decode(&spec, &bytes).unwrap();
                    let x = value.as_record().unwrap().field("x").unwrap().as_i64();
                    assert_eq!(x, Some(sample));
                }
            }
        }
    }

    #[test]
    fn test_short_buffer_consumes_nothing() {
        let spec = LayoutSpec::builder("Header")
            .scalar("a", ScalarKind::U32)
            .scalar("b", ScalarKind::U32)
            .build()
            .unwrap();
        let data = [0u8; 6];
        let cursor = ByteCursor::new(&data);
        let err = decode_at(&spec, cursor).unwrap_err();
        assert!(matches!(
            err,
            Error::BufferTooShort {
                offset: 0,
                needed: 8,
                available: 6
            }
        ));
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_trailing_count_three() {
        let mut data = 3u32.to_le_bytes().to_vec();
        for value in [10u16, 20, 30] {
            data.extend_from_slice(&value.to_le_bytes());
            data.extend_from_slice(&0u16.to_le_bytes());
        }
        let (value, next) = decode_at(&counted(), ByteCursor::new(&data)).unwrap();
        let record = value.as_record().unwrap();
        assert_eq!(values(record), vec![10, 20, 30]);
        assert_eq!(record.size(), 16);
        assert!(next.is_empty());
    }

    #[test]
    fn test_trailing_count_zero() {
        let data = 0u32.to_le_bytes();
        let value = decode(&counted(), &data).unwrap();
        let record = value.as_record().unwrap();
        assert!(record.repeat("items").unwrap().is_empty());
        assert_eq!(record.size(), 4);
    }

    #[test]
    fn test_trailing_truncated_fails_up_front() {
        let mut data = 2u32.to_le_bytes().to_vec();
        data.extend_from_slice(&[1, 0, 0, 0]);
        let err = decode(&counted(), &data).unwrap_err();
        assert!(matches!(err, Error::BufferTooShort { needed: 8, .. }));
    }

    #[test]
    fn test_trailing_huge_count_fails_without_allocating() {
        let data = u32::MAX.to_le_bytes();
        assert!(matches!(
            decode(&counted(), &data),
            Err(Error::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_trailing_with_stride() {
        let spec = LayoutSpec::builder("Strided")
            .scalar("size", ScalarKind::U16)
            .scalar("count", ScalarKind::U16)
            .trailing(
                "items",
                TrailingRepeat::new("count", element()).stride("size"),
            )
            .build()
            .unwrap();

        let mut data = Vec::new();
        data.extend_from_slice(&6u16.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&[7, 0, 0, 0, 0xEE, 0xEE]);
        data.extend_from_slice(&[9, 0, 0, 0, 0xEE, 0xEE]);

        let value = decode(&spec, &data).unwrap();
        let record = value.as_record().unwrap();
        assert_eq!(values(record), vec![7, 9]);
        assert_eq!(record.size(), 16);
    }

    #[test]
    fn test_stride_smaller_than_element() {
        let spec = LayoutSpec::builder("Strided")
            .scalar("size", ScalarKind::U16)
            .scalar("count", ScalarKind::U16)
            .trailing(
                "items",
                TrailingRepeat::new("count", element()).stride("size"),
            )
            .build()
            .unwrap();
        let data = [2, 0, 1, 0, 0, 0, 0, 0];
        assert!(matches!(
            decode(&spec, &data),
            Err(Error::InvalidStride { stride: 2, .. })
        ));
    }

    fn tagged() -> LayoutSpec {
        LayoutSpec::builder("Tagged")
            .flags("flags", ScalarKind::U32, &[("wide", 0x100)])
            .union(
                "payload",
                DiscriminantSource::local("flags").mask(0xFF),
                vec![
                    Alternative::new(0, "byte", Node::Scalar(ScalarKind::U8)),
                    Alternative::new(1, "word", Node::Scalar(ScalarKind::U32)),
                ],
            )
            .scalar("trailer", ScalarKind::U8)
            .build()
            .unwrap()
    }

    #[test]
    fn test_union_selects_alternative() {
        let mut data = 0x101u32.to_le_bytes().to_vec();
        data.extend_from_slice(&0xCAFEu32.to_le_bytes());
        data.push(0x5A);

        let value = decode(&tagged(), &data).unwrap();
        let record = value.as_record().unwrap();
        let payload = record.union("payload").unwrap();
        assert_eq!(payload.discriminant, 1);
        assert_eq!(&*payload.alternative, "word");
        assert_eq!(payload.value.as_u64(), Some(0xCAFE));
        assert!(record.flags("flags").unwrap().contains("wide"));
        assert_eq!(record.u64("trailer").unwrap(), 0x5A);
    }

    #[test]
    fn test_union_consumes_largest_alternative() {
        let mut data = 0u32.to_le_bytes().to_vec();
        data.extend_from_slice(&[0x11, 0xFF, 0xFF, 0xFF]);
        data.push(0x22);

        let value = decode(&tagged(), &data).unwrap();
        let record = value.as_record().unwrap();
        assert_eq!(record.union("payload").unwrap().value.as_u64(), Some(0x11));
        assert_eq!(record.u64("trailer").unwrap(), 0x22);
    }

    #[test]
    fn test_union_unsupported_discriminant_reads_no_payload() {
        let spec = LayoutSpec::builder("Tagged")
            .scalar("kind", ScalarKind::U8)
            .union(
                "payload",
                DiscriminantSource::local("kind"),
                vec![Alternative::new(0, "word", Node::Scalar(ScalarKind::U32))],
            )
            .build()
            .unwrap();

        // Only the discriminant is present
        match decode(&spec, &[7]) {
            Err(Error::DiscriminantUnsupported {
                field,
                value,
                offset,
            }) => {
                assert_eq!(field, "payload");
                assert_eq!(value, 7);
                assert_eq!(offset, 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert!(matches!(
            decode(&spec, &[0, 1]),
            Err(Error::BufferTooShort {
                offset: 1,
                needed: 4,
                available: 1
            })
        ));
        assert!(matches!(
            decode(&spec, &[]),
            Err(Error::BufferTooShort { needed: 1, .. })
        ));
    }

    #[test]
    fn test_fields_after_union_are_bounds_checked() {
        let data = [0u8, 0, 0, 0, 0x11, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            decode(&tagged(), &data),
            Err(Error::BufferTooShort {
                offset: 8,
                needed: 1,
                available: 0
            })
        ));
    }

    #[test]
    fn test_signed_discriminant() {
        let spec = LayoutSpec::builder("Signed")
            .scalar("kind", ScalarKind::I8)
            .union(
                "payload",
                DiscriminantSource::local("kind").mask(0xFF),
                vec![
                    Alternative::new(0, "zero", Node::Scalar(ScalarKind::U32)),
                    Alternative::new(0xFF, "minus_one", Node::Scalar(ScalarKind::U32)),
                ],
            )
            .build()
            .unwrap();

        let value = decode(&spec, &[0xFF, 9, 0, 0, 0]).unwrap();
        let payload = value.as_record().unwrap().union("payload").unwrap();
        assert_eq!(&*payload.alternative, "minus_one");
        assert_eq!(payload.value.as_u64(), Some(9));

        let unmasked = LayoutSpec::builder("Signed")
            .scalar("kind", ScalarKind::I8)
            .union(
                "payload",
                DiscriminantSource::local("kind"),
                vec![Alternative::new(0, "zero", Node::Scalar(ScalarKind::U32))],
            )
            .build()
            .unwrap();
        assert!(matches!(
            decode(&unmasked, &[0xFF, 0, 0, 0, 0]),
            Err(Error::DiscriminantUnsupported {
                value: u64::MAX,
                offset: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_union_unsupported_discriminant_in_record() {
        let mut data = 0x42u32.to_le_bytes().to_vec();
        data.extend_from_slice(&[0; 5]);
        match decode(&tagged(), &data) {
            Err(Error::DiscriminantUnsupported {
                field,
                value,
                offset,
            }) => {
                assert_eq!(field, "payload");
                assert_eq!(value, 0x42);
                assert_eq!(offset, 4);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_enclosing_discriminant() {
        let inner = Arc::new(
            LayoutSpec::builder("Inner")
                .union(
                    "payload",
                    DiscriminantSource::enclosing("kind"),
                    vec![
                        Alternative::new(1, "short", Node::Scalar(ScalarKind::U16)),
                        Alternative::new(2, "long", Node::Scalar(ScalarKind::U32)),
                    ],
                )
                .build()
                .unwrap(),
        );
        let outer = LayoutSpec::builder("Outer")
            .scalar("kind", ScalarKind::U8)
            .nested("inner", inner)
            .build()
            .unwrap();

        let data = [1u8, 0x34, 0x12, 0xFF, 0xFF];
        let value = decode(&outer, &data).unwrap();
        let inner = value.as_record().unwrap().record("inner").unwrap();
        assert_eq!(inner.union("payload").unwrap().value.as_u64(), Some(0x1234));
        assert_eq!(inner.size(), 4);
    }

    #[test]
    fn test_pointer_fields_stay_unresolved() {
        let spec = LayoutSpec::builder("Ptr")
            .pointer("name", PointerKind::Direct, PointerTarget::CString)
            .build()
            .unwrap();
        let data = (-12i32).to_le_bytes();
        let (value, _) = decode_at(&spec, ByteCursor::with_origin(&data, 0x100)).unwrap();
        let pointer = value.as_record().unwrap().pointer("name").unwrap();
        assert_eq!(pointer.offset.field_address(), 0x100);
        assert_eq!(pointer.offset.raw(), -12);
    }

    #[test]
    fn test_decoding_is_deterministic() {
        let mut data = 2u32.to_le_bytes().to_vec();
        data.extend_from_slice(&[1, 0, 2, 0, 3, 0, 4, 0]);
        let first = format!("{:?}", decode(&counted(), &data).unwrap());
        let second = format!("{:?}", decode(&counted(), &data).unwrap());
        assert_eq!(first, second);
    }
}
