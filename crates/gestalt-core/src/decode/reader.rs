//! Composable decoders.
//!
//! A [`ByteReader`] wraps a function from a cursor to a value and the cursor
//! after it. Readers compose by sequencing ([`ByteReader::then`],
//! [`ByteReader::and_then`]) and by mapping ([`ByteReader::map`],
//! [`ByteReader::try_map`]); mapping never touches the bytes again, it only
//! transforms what was already decoded.
//!
//! ```
//! use gestalt_core::decode::ByteReader;
//! use gestalt_core::layout::{ByteOrder, ScalarKind};
//!
//! let pair = ByteReader::scalar(ScalarKind::U16, ByteOrder::Little)
//!     .then(ByteReader::scalar(ScalarKind::U8, ByteOrder::Little))
//!     .map(|(a, b)| a + b);
//! assert_eq!(pair.parse(&[1, 0, 2])?, 3);
//! # Ok::<(), gestalt_core::Error>(())
//! ```

use super::{decode_at, ByteCursor, DecodedValue};
use crate::error::Result;
use crate::layout::{ByteOrder, LayoutSpec, ScalarKind};

type Step<'r, T> = dyn Fn(ByteCursor<'_>) -> Result<(T, ByteCursor<'_>)> + 'r;

/// A decoder producing `T`, valid for the lifetime `'r` of what it borrows
pub struct ByteReader<'r, T> {
    step: Box<Step<'r, T>>,
}

impl<T> std::fmt::Debug for ByteReader<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteReader").finish_non_exhaustive()
    }
}

impl<'r, T: 'r> ByteReader<'r, T> {
    /// Wraps a decoding function
    pub fn new<F>(step: F) -> Self
    where
        F: Fn(ByteCursor<'_>) -> Result<(T, ByteCursor<'_>)> + 'r,
    {
        Self {
            step: Box::new(step),
        }
    }

    /// Runs the reader at `cursor`
    pub fn run<'a>(&self, cursor: ByteCursor<'a>) -> Result<(T, ByteCursor<'a>)> {
        (self.step)(cursor)
    }

    /// Runs the reader at the start of `buffer`, discarding the end cursor
    pub fn parse(&self, buffer: &[u8]) -> Result<T> {
        self.run(ByteCursor::new(buffer)).map(|(value, _)| value)
    }

    /// Transforms the decoded value
    pub fn map<U: 'r>(self, f: impl Fn(T) -> U + 'r) -> ByteReader<'r, U> {
        ByteReader::new(move |cursor| {
            let (value, next) = self.run(cursor)?;
            Ok((f(value), next))
        })
    }

    /// Transforms the decoded value with a fallible function
    pub fn try_map<U: 'r>(self, f: impl Fn(T) -> Result<U> + 'r) -> ByteReader<'r, U> {
        ByteReader::new(move |cursor| {
            let (value, next) = self.run(cursor)?;
            Ok((f(value)?, next))
        })
    }

    /// Runs `next` after this reader, pairing the results
    pub fn then<U: 'r>(self, next: ByteReader<'r, U>) -> ByteReader<'r, (T, U)> {
        ByteReader::new(move |cursor| {
            let (first, cursor) = self.run(cursor)?;
            let (second, cursor) = next.run(cursor)?;
            Ok(((first, second), cursor))
        })
    }

    /// Chooses the next reader from this reader's value
    pub fn and_then<U: 'r>(self, f: impl Fn(T) -> ByteReader<'r, U> + 'r) -> ByteReader<'r, U> {
        ByteReader::new(move |cursor| {
            let (value, cursor) = self.run(cursor)?;
            f(value).run(cursor)
        })
    }

    /// Runs this reader `count` times in a row
    pub fn repeat(self, count: usize) -> ByteReader<'r, Vec<T>> {
        ByteReader::new(move |cursor| {
            let mut items = Vec::new();
            let mut position = cursor;
            for _ in 0..count {
                let (item, next) = self.run(position)?;
                items.push(item);
                position = next;
            }
            Ok((items, position))
        })
    }
}

impl<'r> ByteReader<'r, u64> {
    /// Reads one scalar; signed kinds yield their two's-complement bits
    pub fn scalar(kind: ScalarKind, order: ByteOrder) -> Self {
        ByteReader::new(move |cursor| cursor.read_scalar(kind, order))
    }
}

impl<'r> ByteReader<'r, DecodedValue> {
    /// Decodes one record described by `spec`
    pub fn layout(spec: &'r LayoutSpec) -> Self {
        ByteReader::new(move |cursor| decode_at(spec, cursor))
    }
}
