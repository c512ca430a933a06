//! Disk header: capture parameters and the derived archive geometry.
//!
//! The header occupies the first [`DISK_HEADER_SIZE`] bytes of the archive.
//! [`DiskHeader::initialise`] derives every layout field from the capture
//! parameters and [`DiskHeader::validate`] re-derives and checks them; the
//! same checks run when a fresh header is built and when an existing archive
//! is opened.

use crate::{page_aligned, page_round, DataIndex, DecimatedData, FaEntry, FilterMask, FormatError};
use crate::mask::MAX_FA_ENTRY_COUNT;
use serde::{Deserialize, Serialize};

/// Size of the header page at the start of the archive
pub const DISK_HEADER_SIZE: u64 = 4096;

/// Signature at offset zero of every archive
pub const DISK_SIGNATURE: [u8; 8] = *b"FASNIFF\0";

/// Header layout version
pub const DISK_VERSION: u32 = 3;

/// Capture parameters used to lay out a fresh archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepareParams {
    /// Bytes delivered by one read from the sniffer
    pub input_block_size: u32,
    /// FA samples per channel in one major block
    pub major_sample_count: u32,
    /// First decimation factor (power of 2)
    pub first_decimation: u32,
    /// Second decimation factor (power of 2)
    pub second_decimation: u32,
    /// Nominal sample frequency in Hz
    pub sample_frequency: f64,
    /// Smoothing factor for the block duration estimate
    pub timestamp_iir: f64,
    /// Number of FA entries in each frame
    pub fa_entry_count: u32,
}

impl Default for PrepareParams {
    fn default() -> Self {
        Self {
            input_block_size: 512 * 1024,
            major_sample_count: 65536,
            first_decimation: 64,
            second_decimation: 256,
            sample_frequency: 10072.4,
            timestamp_iir: 0.1,
            fa_entry_count: MAX_FA_ENTRY_COUNT,
        }
    }
}

/// Archive header as held in memory
#[derive(Debug, Clone, PartialEq)]
pub struct DiskHeader {
    pub signature: [u8; 8],
    pub version: u32,

    // Capture parameters
    pub archive_mask: FilterMask,
    pub archive_mask_count: u32,
    pub fa_entry_count: u32,
    pub first_decimation_log2: u32,
    pub second_decimation_log2: u32,
    pub input_block_size: u32,

    // Data layout
    pub major_sample_count: u32,
    pub d_sample_count: u32,
    pub dd_sample_count: u32,
    pub major_block_size: u32,
    pub index_data_start: u64,
    pub index_data_size: u32,
    pub dd_data_start: u64,
    pub dd_data_size: u64,
    pub dd_total_count: u32,
    pub major_data_start: u64,
    pub major_block_count: u32,
    pub total_data_size: u64,

    // Dynamic state
    pub current_major_block: u32,
    pub last_duration: u32,
    pub timestamp_iir: f64,
}

fn require(ok: bool, message: &'static str) -> Result<(), FormatError> {
    if ok {
        Ok(())
    } else {
        Err(FormatError::Inconsistent(message))
    }
}

fn log2_of(name: &'static str, value: u32) -> Result<u32, FormatError> {
    if value.is_power_of_two() {
        Ok(value.trailing_zeros())
    } else {
        Err(FormatError::NotPowerOfTwo { name, value })
    }
}

impl DiskHeader {
    /// Computes a complete header for an archive of `file_size` bytes.
    pub fn initialise(
        archive_mask: &FilterMask,
        file_size: u64,
        params: &PrepareParams,
    ) -> Result<Self, FormatError> {
        let first_decimation_log2 = log2_of("First decimation", params.first_decimation)?;
        let second_decimation_log2 = log2_of("Second decimation", params.second_decimation)?;
        log2_of("Major sample count", params.major_sample_count)?;
        log2_of("FA entry count", params.fa_entry_count)?;
        require(
            params.major_sample_count as u64
                >= params.first_decimation as u64 * params.second_decimation as u64,
            "Major sample count must be no smaller than decimation count",
        )?;

        let archive_mask_count = archive_mask.count();
        let major_sample_count = params.major_sample_count;
        let d_sample_count = major_sample_count >> first_decimation_log2;
        let dd_sample_count = d_sample_count >> second_decimation_log2;
        let major_block_size = u32::try_from(
            archive_mask_count as u64
                * (major_sample_count as u64 * FaEntry::SIZE as u64
                    + d_sample_count as u64 * DecimatedData::SIZE as u64),
        )
        .map_err(|_| FormatError::Inconsistent("Major block size too large"))?;

        // Both the index and DD areas are rounded up to whole pages, so start
        // from a simple estimate and walk down until everything fits.
        let data_size = file_size
            .checked_sub(DISK_HEADER_SIZE)
            .ok_or(FormatError::FileTooSmall(file_size))?;
        let index_entry_size = DataIndex::SIZE as u64;
        let dd_block_size =
            dd_sample_count as u64 * archive_mask_count as u64 * DecimatedData::SIZE as u64;
        let per_block = index_entry_size + dd_block_size + major_block_size as u64;
        let mut major_block_count = data_size / per_block.max(1);
        let areas = |count: u64| {
            (
                page_round(count * index_entry_size),
                page_round(count * dd_block_size),
            )
        };
        let (mut index_data_size, mut dd_data_size) = areas(major_block_count);
        while major_block_count > 0
            && index_data_size + dd_data_size + major_block_count * major_block_size as u64
                > data_size
        {
            major_block_count -= 1;
            (index_data_size, dd_data_size) = areas(major_block_count);
        }
        let major_block_count = u32::try_from(major_block_count)
            .map_err(|_| FormatError::Inconsistent("Too many major blocks"))?;
        let index_data_size = u32::try_from(index_data_size)
            .map_err(|_| FormatError::Inconsistent("Index area too large"))?;

        let index_data_start = DISK_HEADER_SIZE;
        let dd_data_start = index_data_start + index_data_size as u64;
        let major_data_start = dd_data_start + dd_data_size;
        let header = Self {
            signature: DISK_SIGNATURE,
            version: DISK_VERSION,
            archive_mask: *archive_mask,
            archive_mask_count,
            fa_entry_count: params.fa_entry_count,
            first_decimation_log2,
            second_decimation_log2,
            input_block_size: params.input_block_size,
            major_sample_count,
            d_sample_count,
            dd_sample_count,
            major_block_size,
            index_data_start,
            index_data_size,
            dd_data_start,
            dd_data_size,
            dd_total_count: dd_sample_count.saturating_mul(major_block_count),
            major_data_start,
            major_block_count,
            total_data_size: major_data_start
                + major_block_count as u64 * major_block_size as u64,
            current_major_block: 0,
            last_duration: (major_sample_count as f64 * 1e6 / params.sample_frequency).round()
                as u32,
            timestamp_iir: params.timestamp_iir,
        };
        header.validate(file_size)?;
        Ok(header)
    }

    /// Re-derives every layout field and checks it against the stored value.
    pub fn validate(&self, file_size: u64) -> Result<(), FormatError> {
        if self.signature != DISK_SIGNATURE {
            return Err(FormatError::BadSignature);
        }
        if self.version != DISK_VERSION {
            return Err(FormatError::BadVersion(self.version));
        }
        log2_of("FA entry count", self.fa_entry_count)?;
        require(
            self.fa_entry_count <= MAX_FA_ENTRY_COUNT,
            "FA entry count too large",
        )?;

        let count = self.archive_mask_count as u64;
        require(count > 0, "Empty capture mask")?;
        require(
            self.archive_mask.count() == self.archive_mask_count,
            "Inconsistent capture mask",
        )?;
        require(
            self.archive_mask.ids().all(|id| id < self.fa_entry_count),
            "Capture mask exceeds FA entry count",
        )?;

        require(
            self.first_decimation_log2 > 0 && self.second_decimation_log2 > 0,
            "Decimation factors must be greater than 1",
        )?;
        require(
            self.first_decimation_log2
                .checked_add(self.second_decimation_log2)
                .is_some_and(|log2| log2 < 32),
            "Decimation too large",
        )?;
        require(
            (self.d_sample_count as u64) << self.first_decimation_log2
                == self.major_sample_count as u64,
            "Invalid first decimation",
        )?;
        require(
            (self.dd_sample_count as u64) << self.second_decimation_log2
                == self.d_sample_count as u64,
            "Invalid second decimation",
        )?;
        require(self.major_sample_count > 1, "Major sample count too small")?;
        require(self.major_block_count > 1, "Archive too small")?;

        require(
            self.major_block_size as u64
                == count
                    * (self.major_sample_count as u64 * FaEntry::SIZE as u64
                        + self.d_sample_count as u64 * DecimatedData::SIZE as u64),
            "Invalid major block size",
        )?;
        require(
            self.dd_total_count as u64
                == self.dd_sample_count as u64 * self.major_block_count as u64,
            "Invalid DD total count",
        )?;
        require(
            self.index_data_size as u64
                == page_round(self.major_block_count as u64 * DataIndex::SIZE as u64),
            "Invalid index size",
        )?;
        require(
            self.dd_data_size
                == page_round(self.dd_total_count as u64 * count * DecimatedData::SIZE as u64),
            "Invalid DD area size",
        )?;
        require(
            self.timestamp_iir > 0.0 && self.timestamp_iir <= 1.0,
            "Invalid timestamp IIR",
        )?;

        require(
            page_aligned(self.index_data_size as u64)
                && page_aligned(self.dd_data_size)
                && page_aligned(self.major_block_size as u64),
            "Data areas must be page aligned",
        )?;
        require(
            page_aligned(self.index_data_start)
                && page_aligned(self.dd_data_start)
                && page_aligned(self.major_data_start),
            "Data areas must start on page boundaries",
        )?;
        require(
            self.index_data_start == DISK_HEADER_SIZE,
            "Index must follow header",
        )?;
        require(
            self.dd_data_start == self.index_data_start + self.index_data_size as u64,
            "DD area must follow index",
        )?;
        require(
            self.major_data_start == self.dd_data_start + self.dd_data_size,
            "Major data must follow DD area",
        )?;
        require(
            self.total_data_size
                == self.major_data_start
                    + self.major_block_count as u64 * self.major_block_size as u64,
            "Invalid total data size",
        )?;
        require(self.total_data_size <= file_size, "Data size too large for file")?;

        let frame_size = self.fa_entry_count as u64 * FaEntry::SIZE as u64;
        require(
            self.input_block_size as u64 % frame_size == 0,
            "Input block size must be a whole number of frames",
        )?;
        let input_frames = self.input_block_size as u64 / frame_size;
        require(input_frames > 0, "Input block too small")?;
        require(
            self.major_sample_count as u64 % input_frames == 0,
            "Input block must divide major block",
        )?;
        require(
            input_frames % (1u64 << self.first_decimation_log2) == 0,
            "Input block must hold whole decimations",
        )?;

        require(
            self.current_major_block < self.major_block_count,
            "Invalid current index",
        )?;
        require(self.last_duration > 0, "Invalid last duration")?;
        Ok(())
    }

    pub fn first_decimation(&self) -> u32 {
        1 << self.first_decimation_log2
    }

    pub fn second_decimation(&self) -> u32 {
        1 << self.second_decimation_log2
    }

    /// Frames delivered in each input block.
    pub fn input_frame_count(&self) -> u32 {
        self.input_block_size / (self.fa_entry_count * FaEntry::SIZE as u32)
    }

    /// Bytes of raw data for one channel in one major block.
    pub fn fa_block_bytes(&self) -> usize {
        self.major_sample_count as usize * FaEntry::SIZE
    }

    /// Bytes of first decimated data for one channel in one major block.
    pub fn d_block_bytes(&self) -> usize {
        self.d_sample_count as usize * DecimatedData::SIZE
    }

    /// Offset within a major block of the raw data for archived channel `channel`.
    pub fn fa_data_offset(&self, channel: usize) -> usize {
        channel * self.fa_block_bytes()
    }

    /// Offset within a major block of the decimated data for `channel`.
    pub fn d_data_offset(&self, channel: usize) -> usize {
        self.archive_mask_count as usize * self.fa_block_bytes() + channel * self.d_block_bytes()
    }

    /// File offset of major block `block`.
    pub fn major_block_offset(&self, block: u32) -> u64 {
        self.major_data_start + block as u64 * self.major_block_size as u64
    }

    /// File offset of the index entry for `block`.
    pub fn index_offset(&self, block: u32) -> u64 {
        self.index_data_start + block as u64 * DataIndex::SIZE as u64
    }

    /// File offset of DD record `record` for archived channel `channel`.
    pub fn dd_offset(&self, channel: usize, record: u32) -> u64 {
        self.dd_data_start
            + (channel as u64 * self.dd_total_count as u64 + record as u64)
                * DecimatedData::SIZE as u64
    }

    /// Mean frame rate implied by the smoothed block duration.
    pub fn mean_frame_rate(&self) -> f64 {
        1e6 * self.major_sample_count as f64 / self.last_duration as f64
    }

    /// Encodes the header into a full header page.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = FieldWriter::new();
        out.bytes(&self.signature);
        out.u32(self.version);
        for word in self.archive_mask.words() {
            out.u32(*word);
        }
        out.u32(self.archive_mask_count);
        out.u32(self.fa_entry_count);
        out.u32(self.first_decimation_log2);
        out.u32(self.second_decimation_log2);
        out.u32(self.input_block_size);
        out.u32(self.major_sample_count);
        out.u32(self.d_sample_count);
        out.u32(self.dd_sample_count);
        out.u32(self.major_block_size);
        out.u64(self.index_data_start);
        out.u32(self.index_data_size);
        out.u64(self.dd_data_start);
        out.u64(self.dd_data_size);
        out.u32(self.dd_total_count);
        out.u64(self.major_data_start);
        out.u32(self.major_block_count);
        out.u64(self.total_data_size);
        out.u32(self.current_major_block);
        out.u32(self.last_duration);
        out.u64(self.timestamp_iir.to_bits());
        out.finish()
    }

    /// Decodes a header page.  No validation is done here.
    pub fn decode(page: &[u8]) -> Result<Self, FormatError> {
        if page.len() < DISK_HEADER_SIZE as usize {
            return Err(FormatError::ShortHeader(page.len()));
        }
        let mut input = FieldReader { page, at: 0 };
        let mut signature = [0u8; 8];
        signature.copy_from_slice(input.bytes(8));
        let version = input.u32();
        let mut words = [0u32; 8];
        for word in words.iter_mut() {
            *word = input.u32();
        }
        Ok(Self {
            signature,
            version,
            archive_mask: FilterMask::from_words(words),
            archive_mask_count: input.u32(),
            fa_entry_count: input.u32(),
            first_decimation_log2: input.u32(),
            second_decimation_log2: input.u32(),
            input_block_size: input.u32(),
            major_sample_count: input.u32(),
            d_sample_count: input.u32(),
            dd_sample_count: input.u32(),
            major_block_size: input.u32(),
            index_data_start: input.u64(),
            index_data_size: input.u32(),
            dd_data_start: input.u64(),
            dd_data_size: input.u64(),
            dd_total_count: input.u32(),
            major_data_start: input.u64(),
            major_block_count: input.u32(),
            total_data_size: input.u64(),
            current_major_block: input.u32(),
            last_duration: input.u32(),
            timestamp_iir: f64::from_bits(input.u64()),
        })
    }
}

struct FieldWriter {
    page: Vec<u8>,
    at: usize,
}

impl FieldWriter {
    fn new() -> Self {
        Self {
            page: vec![0; DISK_HEADER_SIZE as usize],
            at: 0,
        }
    }

    fn bytes(&mut self, value: &[u8]) {
        self.page[self.at..self.at + value.len()].copy_from_slice(value);
        self.at += value.len();
    }

    fn u32(&mut self, value: u32) {
        self.bytes(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.bytes(&value.to_le_bytes());
    }

    fn finish(self) -> Vec<u8> {
        self.page
    }
}

struct FieldReader<'a> {
    page: &'a [u8],
    at: usize,
}

impl<'a> FieldReader<'a> {
    fn bytes(&mut self, len: usize) -> &'a [u8] {
        let field = &self.page[self.at..self.at + len];
        self.at += len;
        field
    }

    fn u32(&mut self) -> u32 {
        let b = self.bytes(4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn u64(&mut self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8));
        u64::from_le_bytes(raw)
    }
}
