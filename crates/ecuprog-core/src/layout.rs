//! Target memory layout
//!
//! The ECU reports its layout as a compact binary record:
//!
//! ```text
//! [checksum code: u8][region count: u8]
//! repeated: [start: u32 BE][size: u32 BE][kind: u8][flags: u8]
//! ```
//!
//! Flag bit 0 marks a region as writable. A layout is read once per session
//! and never mutated afterwards.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::ChecksumAlgorithm;

const HEADER_LEN: usize = 2;
const REGION_LEN: usize = 10;
const FLAG_WRITABLE: u8 = 0x01;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Memory layout truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Memory layout has no regions")]
    Empty,

    #[error("Unknown checksum code 0x{0:02X} in memory layout")]
    UnknownChecksum(u8),

    #[error("Unknown region kind 0x{0:02X} in memory layout")]
    UnknownRegionKind(u8),

    #[error("Memory layout size exceeds 32-bit address space")]
    SizeOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    Flash,
    Eeprom,
    Ram,
    Bootloader,
}

impl RegionKind {
    fn code(&self) -> u8 {
        match self {
            RegionKind::Flash => 0,
            RegionKind::Eeprom => 1,
            RegionKind::Ram => 2,
            RegionKind::Bootloader => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RegionKind::Flash),
            1 => Some(RegionKind::Eeprom),
            2 => Some(RegionKind::Ram),
            3 => Some(RegionKind::Bootloader),
            _ => None,
        }
    }
}

/// A contiguous address range on the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: u32,
    pub size: u32,
    pub kind: RegionKind,
    pub writable: bool,
}

impl MemoryRegion {
    pub fn new(start: u32, size: u32, kind: RegionKind, writable: bool) -> Self {
        Self {
            start,
            size,
            kind,
            writable,
        }
    }

    /// Exclusive end address, widened so a region ending at 4 GiB is representable
    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.size)
    }

    pub fn overlaps(&self, start: u32, len: u32) -> bool {
        let other_end = u64::from(start) + u64::from(len);
        u64::from(self.start) < other_end && u64::from(start) < self.end()
    }
}

/// Regions and acceptance checksum of a target device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryLayout {
    regions: Vec<MemoryRegion>,
    checksum_kind: ChecksumAlgorithm,
    total_size: u32,
}

impl MemoryLayout {
    pub fn new(
        regions: Vec<MemoryRegion>,
        checksum_kind: ChecksumAlgorithm,
    ) -> Result<Self, LayoutError> {
        if regions.is_empty() {
            return Err(LayoutError::Empty);
        }
        let total_size = regions
            .iter()
            .try_fold(0u32, |acc, r| acc.checked_add(r.size))
            .ok_or(LayoutError::SizeOverflow)?;

        Ok(Self {
            regions,
            checksum_kind,
            total_size,
        })
    }

    /// Decode the device encoding described in the module docs
    pub fn decode(mut data: &[u8]) -> Result<Self, LayoutError> {
        if data.len() < HEADER_LEN {
            return Err(LayoutError::Truncated {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }

        let checksum_code = data.get_u8();
        let count = data.get_u8() as usize;

        let expected = count * REGION_LEN;
        if data.remaining() < expected {
            return Err(LayoutError::Truncated {
                expected: HEADER_LEN + expected,
                actual: HEADER_LEN + data.remaining(),
            });
        }

        let checksum_kind = ChecksumAlgorithm::from_code(checksum_code)
            .ok_or(LayoutError::UnknownChecksum(checksum_code))?;

        let mut regions = Vec::with_capacity(count);
        for _ in 0..count {
            let start = data.get_u32();
            let size = data.get_u32();
            let kind_code = data.get_u8();
            let flags = data.get_u8();
            let kind =
                RegionKind::from_code(kind_code).ok_or(LayoutError::UnknownRegionKind(kind_code))?;
            regions.push(MemoryRegion::new(
                start,
                size,
                kind,
                flags & FLAG_WRITABLE != 0,
            ));
        }

        Self::new(regions, checksum_kind)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.regions.len() * REGION_LEN);
        buf.put_u8(self.checksum_kind.code());
        buf.put_u8(self.regions.len() as u8);
        for region in &self.regions {
            buf.put_u32(region.start);
            buf.put_u32(region.size);
            buf.put_u8(region.kind.code());
            buf.put_u8(if region.writable { FLAG_WRITABLE } else { 0 });
        }
        buf.to_vec()
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn checksum_kind(&self) -> ChecksumAlgorithm {
        self.checksum_kind
    }

    /// Sum of all region sizes
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn regions_of(&self, kind: RegionKind) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().filter(move |r| r.kind == kind)
    }

    /// Total size of writable regions of `kind`
    pub fn capacity_of(&self, kind: RegionKind) -> u32 {
        self.regions_of(kind)
            .filter(|r| r.writable)
            .fold(0u32, |acc, r| acc.saturating_add(r.size))
    }

    /// Start address of the first writable region of `kind`
    pub fn program_base(&self, kind: RegionKind) -> Option<u32> {
        self.regions_of(kind).find(|r| r.writable).map(|r| r.start)
    }

    /// Bytes from `start` covered without a gap by writable regions of `kind`
    pub fn contiguous_writable(&self, kind: RegionKind, start: u32) -> u64 {
        let mut regions: Vec<&MemoryRegion> =
            self.regions_of(kind).filter(|r| r.writable).collect();
        regions.sort_by_key(|r| r.start);

        let mut cursor = u64::from(start);
        for region in regions {
            if u64::from(region.start) <= cursor && region.end() > cursor {
                cursor = region.end();
            }
        }
        cursor - u64::from(start)
    }

    pub fn regions_overlapping(
        &self,
        start: u32,
        len: u32,
    ) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().filter(move |r| r.overlaps(start, len))
    }
}
