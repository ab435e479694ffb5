//! Mangled name runs and the name-decoding seam.
//!
//! Names stored in reflection sections are byte runs that mix plain mangled
//! text with embedded symbolic references. A control byte in `0x01..=0x17`
//! is followed by a 4-byte relative offset, one in `0x18..=0x1F` by a
//! pointer-sized absolute address, and `0x00` ends the run.
//!
//! Turning mangled text into readable type names is left to a
//! [`NameDecoder`] supplied by the caller. [`VerbatimNames`] keeps the text as
//! is and renders symbolic references as placeholders.

use crate::layout::ByteOrder;

/// Last control byte introducing a 4-byte relative reference
const LAST_RELATIVE_REFERENCE: u8 = 0x17;
/// Last control byte introducing a pointer-sized absolute reference
const LAST_ABSOLUTE_REFERENCE: u8 = 0x1F;

/// Length of the name run at the start of `bytes`, excluding the terminator
///
/// Returns `None` when no terminator is found or a reference payload runs
/// past the end of `bytes`.
pub fn symbolic_run_extent(bytes: &[u8], pointer_width: usize) -> Option<usize> {
    let mut index = 0;
    loop {
        let control = *bytes.get(index)?;
        index += match control {
            0 => return Some(index),
            1..=LAST_RELATIVE_REFERENCE => 1 + 4,
            0x18..=LAST_ABSOLUTE_REFERENCE => 1 + pointer_width,
            _ => 1,
        };
        if index > bytes.len() {
            return None;
        }
    }
}

/// A mangled name run located in an image
#[derive(Debug, Clone, Copy)]
pub struct NameRun<'a> {
    /// Address of the first byte of the run
    pub address: u64,
    /// Run contents, without the terminator
    pub bytes: &'a [u8],
    /// Width of absolute references
    pub pointer_width: usize,
    /// Byte order of reference payloads
    pub byte_order: ByteOrder,
}

/// One piece of a name run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePiece<'a> {
    /// Plain mangled text
    Text(&'a [u8]),
    /// A symbolic reference to a descriptor
    Reference {
        /// Control byte introducing the reference
        control: u8,
        /// Address the reference refers to
        target: u64,
    },
}

impl<'a> NameRun<'a> {
    /// Splits the run into text and references
    pub fn pieces(&self) -> Vec<NamePiece<'a>> {
        let mut pieces = Vec::new();
        let mut text_start = 0;
        let mut index = 0;
        while index < self.bytes.len() {
            let control = self.bytes[index];
            let payload = match control {
                1..=LAST_RELATIVE_REFERENCE => 4,
                0x18..=LAST_ABSOLUTE_REFERENCE => self.pointer_width,
                _ => {
                    index += 1;
                    continue;
                }
            };
            let Some(raw) = self.bytes.get(index + 1..index + 1 + payload) else {
                break;
            };

            if text_start < index {
                pieces.push(NamePiece::Text(&self.bytes[text_start..index]));
            }
            let value = self.byte_order.read_uint(raw);
            let target = if control <= LAST_RELATIVE_REFERENCE {
                let field = self.address.wrapping_add(index as u64 + 1);
                field.wrapping_add_signed(i64::from(value as u32 as i32))
            } else {
                value
            };
            pieces.push(NamePiece::Reference { control, target });

            index += 1 + payload;
            text_start = index;
        }
        if text_start < self.bytes.len() {
            pieces.push(NamePiece::Text(&self.bytes[text_start..]));
        }
        pieces
    }
}

/// Turns mangled names into display strings
///
/// Implementations must be total: any input yields some string.
pub trait NameDecoder: Send + Sync {
    /// Decodes a plain mangled string
    fn decode(&self, encoded: &str) -> String;

    /// Length of the name run at the start of `bytes`
    fn run_extent(&self, bytes: &[u8], pointer_width: usize) -> Option<usize> {
        symbolic_run_extent(bytes, pointer_width)
    }

    /// Decodes a name run that may contain symbolic references
    fn decode_run(&self, run: &NameRun<'_>) -> String;
}

/// Identity decoder
///
/// Text is returned unchanged; symbolic references become
/// `<ref 0xNN @0xADDRESS>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerbatimNames;

impl NameDecoder for VerbatimNames {
    fn decode(&self, encoded: &str) -> String {
        encoded.to_string()
    }

    fn decode_run(&self, run: &NameRun<'_>) -> String {
        let mut out = String::new();
        for piece in run.pieces() {
            match piece {
                NamePiece::Text(text) => out.push_str(&String::from_utf8_lossy(text)),
                NamePiece::Reference { control, target } => {
                    out.push_str(&format!("<ref {control:#04x} @{target:#x}>"));
                }
            }
        }
        out
    }
}
