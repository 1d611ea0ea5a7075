//! Cursor-style reader shared by all binary decoders.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("empty input")]
    EmptyInput,

    #[error("trailing bytes after decode: {0}")]
    TrailingBytes(usize),

    #[error("invalid address version {0}")]
    InvalidAddressVersion(u8),

    #[error("invalid address hash length {0}")]
    InvalidAddressLength(usize),

    #[error("unknown covenant type {0}")]
    UnknownCovenantType(u8),

    #[error("covenant item count mismatch: expected {expected}, got {got}")]
    CovenantItemCount { expected: usize, got: usize },

    #[error("covenant item {index} has invalid length {len}")]
    CovenantItemLength { index: usize, len: usize },

    #[error("unknown resource record type {0}")]
    UnknownRecordType(u8),

    #[error("unsupported resource version {0}")]
    UnsupportedResourceVersion(u8),

    #[error("invalid domain name: {0}")]
    InvalidName(&'static str),

    #[error("value out of range: {0}")]
    OutOfRange(&'static str),
}

/// A borrowing cursor over a byte buffer.
///
/// Keeps the original buffer reachable so that decoders needing absolute
/// offsets (name compression pointers, transaction id slices) can seek within
/// it.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// The full buffer this reader was created over.
    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Reposition the cursor at an absolute offset within the buffer.
    pub fn seek(&mut self, pos: usize) -> Result<(), DecodeError> {
        if pos > self.buf.len() {
            return Err(DecodeError::UnexpectedEof {
                needed: pos,
                remaining: self.buf.len(),
            });
        }

        self.pos = pos;

        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof {
                needed: len,
                remaining: self.remaining(),
            });
        }

        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;

        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);

        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(LittleEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        Ok(BigEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(LittleEndian::read_u64(self.read_bytes(8)?))
    }
}
