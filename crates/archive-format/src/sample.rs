//! Fixed size records stored in frames, major blocks, the DD area and the index.
//!
//! Everything on disk is little-endian.  Records are decoded from and encoded
//! into byte slices rather than transmuted so that the mapped areas never need
//! any particular alignment.

use serde::{Deserialize, Serialize};

#[inline]
fn le_i32(bytes: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// One X/Y position sample for a single channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaEntry {
    pub x: i32,
    pub y: i32,
}

impl FaEntry {
    pub const SIZE: usize = 8;

    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Decodes an entry from the first 8 bytes of `bytes`.
    #[inline]
    pub fn read_from(bytes: &[u8]) -> Self {
        Self {
            x: le_i32(bytes, 0),
            y: le_i32(bytes, 4),
        }
    }

    #[inline]
    pub fn write_to(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.x.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.y.to_le_bytes());
    }
}

/// Decimated statistics for one channel over one decimation interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecimatedData {
    pub min: FaEntry,
    pub max: FaEntry,
    pub mean: FaEntry,
    pub std: FaEntry,
}

impl DecimatedData {
    pub const SIZE: usize = 32;

    pub fn read_from(bytes: &[u8]) -> Self {
        Self {
            min: FaEntry::read_from(&bytes[0..]),
            max: FaEntry::read_from(&bytes[8..]),
            mean: FaEntry::read_from(&bytes[16..]),
            std: FaEntry::read_from(&bytes[24..]),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        self.min.write_to(&mut bytes[0..]);
        self.max.write_to(&mut bytes[8..]);
        self.mean.write_to(&mut bytes[16..]);
        self.std.write_to(&mut bytes[24..]);
    }

    /// Returns the selected fields in storage order.
    ///
    /// Bit 0 selects `min`, bit 1 `max`, bit 2 `mean` and bit 3 `std`.
    pub fn fields(&self, data_mask: u32) -> impl Iterator<Item = FaEntry> + '_ {
        [self.min, self.max, self.mean, self.std]
            .into_iter()
            .enumerate()
            .filter(move |(bit, _)| data_mask & (1 << bit) != 0)
            .map(|(_, entry)| entry)
    }
}

/// Index record describing one major block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataIndex {
    /// Start of block in microseconds since the epoch
    pub timestamp: u64,
    /// Block duration in microseconds, zero for a never written block
    pub duration: u32,
    /// Channel 0 X value of the first frame in the block
    pub id_zero: u32,
}

impl DataIndex {
    pub const SIZE: usize = 16;

    pub fn read_from(bytes: &[u8]) -> Self {
        Self {
            timestamp: le_u64(bytes, 0),
            duration: le_u32(bytes, 8),
            id_zero: le_u32(bytes, 12),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        bytes[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.duration.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.id_zero.to_le_bytes());
    }
}
