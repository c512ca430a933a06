//! Binary response records, all little endian

use std::io::{self, Write};

/// Gap list entry: where a contiguous run starts in the delivered data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapData {
    pub data_index: u32,
    pub id_zero: u32,
    pub timestamp: u64,
}

impl GapData {
    pub const SIZE: usize = 16;

    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_all(&self.data_index.to_le_bytes())?;
        out.write_all(&self.id_zero.to_le_bytes())?;
        out.write_all(&self.timestamp.to_le_bytes())
    }
}

/// Sent once before extended timestamp data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedTimestampHeader {
    /// Samples per block
    pub block_size: u32,
    /// Offset of the first sample into the first block
    pub offset: u32,
}

impl ExtendedTimestampHeader {
    pub const SIZE: usize = 8;

    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_all(&self.block_size.to_le_bytes())?;
        out.write_all(&self.offset.to_le_bytes())
    }
}

/// Sent before every block when extended timestamps are enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedTimestamp {
    pub timestamp: u64,
    pub duration: u32,
    /// Only present on subscriptions asking for id_zero
    pub id_zero: Option<u32>,
}

impl ExtendedTimestamp {
    pub fn size(&self) -> usize {
        if self.id_zero.is_some() {
            16
        } else {
            12
        }
    }

    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_all(&self.timestamp.to_le_bytes())?;
        out.write_all(&self.duration.to_le_bytes())?;
        if let Some(id_zero) = self.id_zero {
            out.write_all(&id_zero.to_le_bytes())?;
        }
        Ok(())
    }
}

/// Formats a microsecond timestamp as `seconds.micros`.
pub fn format_timestamp(micros: u64) -> String {
    format!("{}.{:06}", micros / 1_000_000, micros % 1_000_000)
}
