//! Generic coding-byte access
//!
//! Long-coding strings are plain byte arrays; this module only reads and
//! writes bits and bit fields. What a bit means is manufacturer knowledge
//! and lives elsewhere.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodingError {
    #[error("Byte index {index} out of range (coding has {len} bytes)")]
    ByteOutOfRange { index: usize, len: usize },

    #[error("Bit field shift {shift} width {width} does not fit in a byte")]
    InvalidField { shift: u8, width: u8 },

    #[error("Value 0x{value:02X} does not fit in {width} bits")]
    ValueTooWide { value: u8, width: u8 },

    #[error("Invalid coding hex: {0}")]
    InvalidHex(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodingBytes(Vec<u8>);

impl CodingBytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn bit(&self, byte: usize, bit: u8) -> Result<bool, CodingError> {
        Ok(self.field(byte, bit, 1)? == 1)
    }

    pub fn set_bit(&mut self, byte: usize, bit: u8, on: bool) -> Result<(), CodingError> {
        self.set_field(byte, bit, 1, on as u8)
    }

    /// `width` bits starting at bit `shift` (bit 0 = LSB)
    pub fn field(&self, byte: usize, shift: u8, width: u8) -> Result<u8, CodingError> {
        let mask = field_mask(shift, width)?;
        let value = self.byte(byte)?;
        Ok((value & mask) >> shift)
    }

    pub fn set_field(
        &mut self,
        byte: usize,
        shift: u8,
        width: u8,
        value: u8,
    ) -> Result<(), CodingError> {
        let mask = field_mask(shift, width)?;
        if width < 8 && value >> width != 0 {
            return Err(CodingError::ValueTooWide { value, width });
        }
        let len = self.0.len();
        let slot = self
            .0
            .get_mut(byte)
            .ok_or(CodingError::ByteOutOfRange { index: byte, len })?;
        *slot = (*slot & !mask) | ((value << shift) & mask);
        Ok(())
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.0)
    }

    fn byte(&self, index: usize) -> Result<u8, CodingError> {
        self.0.get(index).copied().ok_or(CodingError::ByteOutOfRange {
            index,
            len: self.0.len(),
        })
    }
}

fn field_mask(shift: u8, width: u8) -> Result<u8, CodingError> {
    if width == 0 || u16::from(shift) + u16::from(width) > 8 {
        return Err(CodingError::InvalidField { shift, width });
    }
    Ok((((1u16 << width) - 1) << shift) as u8)
}

impl FromStr for CodingBytes {
    type Err = CodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        hex::decode(cleaned)
            .map(Self)
            .map_err(|e| CodingError::InvalidHex(e.to_string()))
    }
}

impl fmt::Display for CodingBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
