//! Checksum and CRC algorithms guarding firmware and calibration transfers
//!
//! All functions are pure: they never mutate their input and perform no I/O.
//! Multi-byte digests are emitted big-endian when used as a trailer.

use std::fmt;
use std::str::FromStr;

use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISO_HDLC, CRC_8_SMBUS};
use serde::{Deserialize, Serialize};

/// CRC-8 with polynomial 0x07, init 0x00, MSB-first
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// CRC-16/CCITT-FALSE (catalogued as IBM-3740)
const CRC16_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-32 calculator (ISO HDLC / CRC-32)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Default CRC-8 polynomial
pub const CRC8_DEFAULT_POLY: u8 = 0x07;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumAlgorithm {
    /// Sum of all bytes, mod 256
    Sum8,
    /// Sum of big-endian 16-bit words, mod 65536
    Sum16,
    /// CRC-8, polynomial 0x07
    Crc8,
    /// CRC-16/CCITT-FALSE, polynomial 0x1021, init 0xFFFF
    Crc16Ccitt,
    /// CRC-32/ISO-HDLC
    Crc32,
    /// XOR of all bytes
    Xor,
}

impl ChecksumAlgorithm {
    /// All algorithms, in wire-code order
    pub const ALL: [ChecksumAlgorithm; 6] = [
        ChecksumAlgorithm::Sum8,
        ChecksumAlgorithm::Sum16,
        ChecksumAlgorithm::Crc8,
        ChecksumAlgorithm::Crc16Ccitt,
        ChecksumAlgorithm::Crc32,
        ChecksumAlgorithm::Xor,
    ];

    /// Size of the digest trailer in bytes
    pub fn trailer_size(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sum8 => 1,
            ChecksumAlgorithm::Sum16 => 2,
            ChecksumAlgorithm::Crc8 => 1,
            ChecksumAlgorithm::Crc16Ccitt => 2,
            ChecksumAlgorithm::Crc32 => 4,
            ChecksumAlgorithm::Xor => 1,
        }
    }

    /// Code used by the memory layout encoding
    pub fn code(&self) -> u8 {
        match self {
            ChecksumAlgorithm::Sum8 => 0,
            ChecksumAlgorithm::Sum16 => 1,
            ChecksumAlgorithm::Crc8 => 2,
            ChecksumAlgorithm::Crc16Ccitt => 3,
            ChecksumAlgorithm::Crc32 => 4,
            ChecksumAlgorithm::Xor => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sum8 => "sum8",
            ChecksumAlgorithm::Sum16 => "sum16",
            ChecksumAlgorithm::Crc8 => "crc8",
            ChecksumAlgorithm::Crc16Ccitt => "crc16-ccitt",
            ChecksumAlgorithm::Crc32 => "crc32",
            ChecksumAlgorithm::Xor => "xor",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "sum8" => Ok(ChecksumAlgorithm::Sum8),
            "sum16" => Ok(ChecksumAlgorithm::Sum16),
            "crc8" => Ok(ChecksumAlgorithm::Crc8),
            "crc16-ccitt" | "crc16" => Ok(ChecksumAlgorithm::Crc16Ccitt),
            "crc32" => Ok(ChecksumAlgorithm::Crc32),
            "xor" | "xor8" => Ok(ChecksumAlgorithm::Xor),
            other => Err(format!("Unknown checksum algorithm: {}", other)),
        }
    }
}

pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Running sum of big-endian byte pairs; an odd trailing byte is the high byte
/// of a final word whose low byte is zero.
pub fn sum16(data: &[u8]) -> u16 {
    data.chunks(2).fold(0u16, |acc, pair| {
        let word = match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from(*hi) << 8,
            _ => 0,
        };
        acc.wrapping_add(word)
    })
}

pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Bit-by-bit MSB-first CRC-8 with an arbitrary polynomial and zero init
pub fn crc8_with_poly(data: &[u8], poly: u8) -> u8 {
    let mut crc = 0u8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
        }
    }
    crc
}

pub fn crc16_ccitt(data: &[u8]) -> u16 {
    CRC16_CCITT.checksum(data)
}

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

pub fn xor8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Compute the trailer bytes for `data` under `algorithm`
pub fn calculate_checksum(data: &[u8], algorithm: ChecksumAlgorithm) -> Vec<u8> {
    match algorithm {
        ChecksumAlgorithm::Sum8 => vec![sum8(data)],
        ChecksumAlgorithm::Sum16 => sum16(data).to_be_bytes().to_vec(),
        ChecksumAlgorithm::Crc8 => vec![crc8(data)],
        ChecksumAlgorithm::Crc16Ccitt => crc16_ccitt(data).to_be_bytes().to_vec(),
        ChecksumAlgorithm::Crc32 => crc32(data).to_be_bytes().to_vec(),
        ChecksumAlgorithm::Xor => vec![xor8(data)],
    }
}

/// Return `payload` followed by its checksum trailer
pub fn append_checksum(payload: &[u8], algorithm: ChecksumAlgorithm) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + algorithm.trailer_size());
    out.extend_from_slice(payload);
    out.extend_from_slice(&calculate_checksum(payload, algorithm));
    out
}

/// Check that the trailing digest of `data` matches the payload before it.
///
/// Returns `false` when `data` is shorter than the trailer.
pub fn verify(data: &[u8], algorithm: ChecksumAlgorithm) -> bool {
    let trailer = algorithm.trailer_size();
    if data.len() < trailer {
        return false;
    }
    let (payload, expected) = data.split_at(data.len() - trailer);
    calculate_checksum(payload, algorithm) == expected
}
