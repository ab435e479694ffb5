//! Immutable, bounds-checked views over a byte buffer.

use crate::error::{Error, Result};
use crate::layout::{ByteOrder, ScalarKind};

/// A read position within a buffer
///
/// The cursor never mutates: every read returns the value together with a
/// new cursor placed after it. `origin` is the address of the buffer's first
/// byte in the owning image, so [`ByteCursor::address`] yields image
/// addresses suitable for relative pointer arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    origin: u64,
    position: usize,
}

impl<'a> ByteCursor<'a> {
    /// Cursor at the start of `data`, which lives at address 0
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_origin(data, 0)
    }

    /// Cursor at the start of `data`, which lives at address `origin`
    pub fn with_origin(data: &'a [u8], origin: u64) -> Self {
        Self {
            data,
            origin,
            position: 0,
        }
    }

    /// Whole underlying buffer
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Address of the buffer's first byte
    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Offset of the cursor from the buffer start
    pub fn position(&self) -> usize {
        self.position
    }

    /// Address of the next byte to be read, saturating at `u64::MAX`
    pub fn address(&self) -> u64 {
        self.origin.saturating_add(self.position as u64)
    }

    /// Bytes left before the end of the buffer
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// True when no bytes remain
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unread bytes
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    /// Fails with `BufferTooShort` unless `needed` bytes remain
    pub fn ensure(&self, needed: usize) -> Result<()> {
        if self.remaining() < needed {
            return Err(Error::buffer_too_short(
                self.address(),
                needed,
                self.remaining(),
            ));
        }
        Ok(())
    }

    /// Splits off the next `n` bytes
    pub fn take(self, n: usize) -> Result<(&'a [u8], Self)> {
        self.ensure(n)?;
        let bytes = &self.data[self.position..self.position + n];
        Ok((
            bytes,
            Self {
                position: self.position + n,
                ..self
            },
        ))
    }

    /// Skips `n` bytes
    pub fn advance(self, n: usize) -> Result<Self> {
        self.take(n).map(|(_, next)| next)
    }

    /// Reads an unsigned integer of `width` bytes (at most 8)
    pub fn read_uint(self, width: usize, order: ByteOrder) -> Result<(u64, Self)> {
        let (bytes, next) = self.take(width)?;
        Ok((order.read_uint(bytes), next))
    }

    /// Reads a scalar, returning its raw bits zero- or sign-extended to 64 bits
    pub fn read_scalar(self, kind: ScalarKind, order: ByteOrder) -> Result<(u64, Self)> {
        let (raw, next) = self.read_uint(kind.width(), order)?;
        if kind.is_signed() {
            Ok((sign_extend(raw, kind.width()) as u64, next))
        } else {
            Ok((raw, next))
        }
    }

    /// Reads a signed 32-bit value
    pub fn read_i32(self, order: ByteOrder) -> Result<(i32, Self)> {
        let (raw, next) = self.read_uint(4, order)?;
        Ok((raw as u32 as i32, next))
    }
}

/// Sign-extends the low `width` bytes of `raw`
pub(crate) fn sign_extend(raw: u64, width: usize) -> i64 {
    let unused = 64 - (width as u32 * 8);
    ((raw << unused) as i64) >> unused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_produce_new_cursors() {
        let data = [0x01, 0x00, 0x02, 0x00, 0x00, 0x00];
        let start = ByteCursor::with_origin(&data, 0x1000);
        let (a, after_a) = start.read_uint(2, ByteOrder::Little).unwrap();
        let (b, after_b) = after_a.read_uint(4, ByteOrder::Little).unwrap();

        assert_eq!((a, b), (1, 2));
        assert_eq!(start.position(), 0);
        assert_eq!(after_a.address(), 0x1002);
        assert!(after_b.is_empty());
    }

    #[test]
    fn test_short_read_fails_with_position() {
        let data = [0xAA, 0xBB, 0xCC];
        let cursor = ByteCursor::with_origin(&data, 0x20).advance(1).unwrap();
        match cursor.read_uint(4, ByteOrder::Little) {
            Err(Error::BufferTooShort {
                offset,
                needed,
                available,
            }) => {
                assert_eq!(offset, 0x21);
                assert_eq!(needed, 4);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_sign_extension() {
        assert_eq!(sign_extend(0xFF, 1), -1);
        assert_eq!(sign_extend(0x7F, 1), 127);
        assert_eq!(sign_extend(0x8000, 2), -32768);
        assert_eq!(sign_extend(u64::MAX, 8), -1);
    }

    #[test]
    fn test_read_i32_negative() {
        let data = (-8i32).to_le_bytes();
        let (value, _) = ByteCursor::new(&data).read_i32(ByteOrder::Little).unwrap();
        assert_eq!(value, -8);
    }
}
