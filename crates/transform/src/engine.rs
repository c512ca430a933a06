//! Major block assembly
//!
//! Each input block is transposed into the active major block buffer,
//! decimated into the D area of the same buffer and accumulated towards the
//! next DD record.  When the major block is full its index entry is fitted,
//! the block is handed to the disk writer and the current block advances.

use crate::{SharedArchive, TransformError};
use fa_decimation::{decimate_strided, ChannelAccumulator, ChannelKind};
use fa_format::{DataIndex, DecimatedData, DiskHeader, FaEntry};
use fa_ring_buffer::PageBuffer;
use fa_storage::DiskWriter;
use std::sync::Arc;
use tracing::{debug, info};

/// Fits a straight line through the end times of the input blocks of a major
/// block, returning the start time of the major block and its duration.
///
/// `offsets` are block end times relative to `first`.  The fit is centred
/// so that `t = 2i - N + 1` and `sum(t^2) = N(N^2 - 1)/3`.
pub(crate) fn fit_timestamps(first: u64, offsets: &[i64], last_duration: u32) -> (u64, u32) {
    let n = offsets.len() as i64;
    if n < 2 {
        return (first.saturating_sub(last_duration as u64), last_duration);
    }
    let mut sum_x = 0i64;
    let mut sum_xt = 0i64;
    for (i, &x) in offsets.iter().enumerate() {
        let t = 2 * i as i64 - n + 1;
        sum_x += x;
        sum_xt += x * t;
    }
    let sum_t2 = (n * n - 1) * n / 3;
    let duration = (2 * n * sum_xt / sum_t2).clamp(0, u32::MAX as i64) as u32;
    let timestamp = first.wrapping_add_signed(sum_x / n - (n + 1) * sum_xt / sum_t2);
    (timestamp, duration)
}

/// Consumes input blocks and builds major blocks
pub struct TransformEngine {
    archive: SharedArchive,
    writer: Arc<DiskWriter>,
    header: DiskHeader,
    /// FA id of each archived channel
    channel_ids: Vec<usize>,
    kinds: Vec<ChannelKind>,

    active: PageBuffer,
    spare: Option<PageBuffer>,
    /// FA samples per channel in the active block
    fa_offset: usize,
    /// D samples per channel in the active block
    d_offset: usize,

    dd_accumulators: Vec<ChannelAccumulator>,
    /// D samples folded into the DD accumulators
    dd_pending: u32,
    /// Next DD record
    dd_offset: u32,

    first_timestamp: u64,
    timestamps: Vec<i64>,
    id_zero: u32,
}

impl TransformEngine {
    pub fn new(
        archive: SharedArchive,
        writer: Arc<DiskWriter>,
        events_fa_id: Option<u32>,
    ) -> Result<Self, TransformError> {
        let header = archive.lock().header().clone();
        let channel_ids: Vec<usize> = header.archive_mask.ids().map(|id| id as usize).collect();
        let kinds: Vec<ChannelKind> = header
            .archive_mask
            .ids()
            .map(|id| {
                if Some(id) == events_fa_id {
                    ChannelKind::Events
                } else {
                    ChannelKind::Position
                }
            })
            .collect();
        if let Some(id) = events_fa_id {
            if header.archive_mask.position(id).is_none() {
                info!(events_fa_id = id, "Events channel not archived");
            }
        }

        let block_size = header.major_block_size as usize;
        let timestamp_count = (header.major_sample_count / header.input_frame_count()) as usize;
        let dd_offset = header.current_major_block * header.dd_sample_count;
        Ok(Self {
            archive,
            writer,
            dd_accumulators: kinds.iter().map(|&kind| ChannelAccumulator::new(kind)).collect(),
            channel_ids,
            kinds,
            active: PageBuffer::zeroed(block_size)?,
            spare: Some(PageBuffer::zeroed(block_size)?),
            fa_offset: 0,
            d_offset: 0,
            dd_pending: 0,
            dd_offset,
            first_timestamp: 0,
            timestamps: Vec::with_capacity(timestamp_count),
            id_zero: 0,
            header,
        })
    }

    pub fn header(&self) -> &DiskHeader {
        &self.header
    }

    /// Processes one input block, or a gap when `block` is `None`.
    pub fn process_block(&mut self, block: Option<(&[u8], u64)>) -> Result<(), TransformError> {
        let Some((data, timestamp)) = block else {
            self.reset();
            return Ok(());
        };
        let expected = self.header.input_block_size as usize;
        if data.len() != expected {
            return Err(TransformError::BlockSize {
                actual: data.len(),
                expected,
            });
        }

        self.index_input_block(data, timestamp);
        self.transpose(data);
        self.decimate(data);
        self.fa_offset += self.header.input_frame_count() as usize;
        if self.fa_offset >= self.header.major_sample_count as usize {
            self.write_major_block()?;
        }
        Ok(())
    }

    fn frame_bytes(&self) -> usize {
        self.header.fa_entry_count as usize * FaEntry::SIZE
    }

    fn index_input_block(&mut self, data: &[u8], timestamp: u64) {
        if self.timestamps.is_empty() {
            self.first_timestamp = timestamp;
            self.id_zero = FaEntry::read_from(data).x as u32;
        }
        self.timestamps
            .push(timestamp.wrapping_sub(self.first_timestamp) as i64);
    }

    fn transpose(&mut self, data: &[u8]) {
        let frames = self.header.input_frame_count() as usize;
        let frame_bytes = self.frame_bytes();
        for (channel, &id) in self.channel_ids.iter().enumerate() {
            let at = self.header.fa_data_offset(channel) + self.fa_offset * FaEntry::SIZE;
            let column = &mut self.active[at..at + frames * FaEntry::SIZE];
            for (frame, out) in column.chunks_exact_mut(FaEntry::SIZE).enumerate() {
                let from = frame * frame_bytes + id * FaEntry::SIZE;
                out.copy_from_slice(&data[from..from + FaEntry::SIZE]);
            }
        }
    }

    fn decimate(&mut self, data: &[u8]) {
        let first = self.header.first_decimation() as usize;
        let first_log2 = self.header.first_decimation_log2;
        let dd_log2 = first_log2 + self.header.second_decimation_log2;
        let frame_bytes = self.frame_bytes();
        let groups = self.header.input_frame_count() as usize / first;

        let mut dd_records = Vec::new();
        for group in 0..groups {
            let frames = &data[group * first * frame_bytes..];
            for (channel, &id) in self.channel_ids.iter().enumerate() {
                let mut acc = ChannelAccumulator::new(self.kinds[channel]);
                decimate_strided(&frames[id * FaEntry::SIZE..], frame_bytes, first, &mut acc);
                let at = self.header.d_data_offset(channel)
                    + (self.d_offset + group) * DecimatedData::SIZE;
                acc.result(first_log2)
                    .to_record()
                    .write_to(&mut self.active[at..at + DecimatedData::SIZE]);
                self.dd_accumulators[channel].merge(&acc);
            }

            self.dd_pending += 1;
            if self.dd_pending == self.header.second_decimation() {
                let records: Vec<DecimatedData> = self
                    .dd_accumulators
                    .iter_mut()
                    .map(|acc| {
                        let record = acc.result(dd_log2).to_record();
                        acc.reset();
                        record
                    })
                    .collect();
                dd_records.push((self.dd_offset, records));
                self.dd_pending = 0;
                self.dd_offset = (self.dd_offset + 1) % self.header.dd_total_count;
            }
        }
        self.d_offset += groups;

        if !dd_records.is_empty() {
            let mut archive = self.archive.lock();
            for (record, values) in &dd_records {
                for (channel, value) in values.iter().enumerate() {
                    archive.set_dd_record(channel, *record, value);
                }
            }
        }
    }

    fn write_major_block(&mut self) -> Result<(), TransformError> {
        let (timestamp, duration) = fit_timestamps(
            self.first_timestamp,
            &self.timestamps,
            self.header.last_duration,
        );
        let next = match self.spare.take() {
            Some(buffer) => buffer,
            None => match self.writer.reclaim()? {
                Some(buffer) => buffer,
                None => PageBuffer::zeroed(self.header.major_block_size as usize)?,
            },
        };
        let full = std::mem::replace(&mut self.active, next);

        let block = {
            let mut archive = self.archive.lock();
            let block = archive.header().current_major_block;
            self.writer
                .schedule_write(self.header.major_block_offset(block), full)?;
            archive.set_index_entry(
                block,
                &DataIndex {
                    timestamp,
                    duration,
                    id_zero: self.id_zero,
                },
            );
            let header = archive.header_mut();
            let iir = header.timestamp_iir;
            header.last_duration =
                (duration as f64 * iir + header.last_duration as f64 * (1.0 - iir)).round() as u32;
            header.current_major_block = (block + 1) % header.major_block_count;
            self.header.last_duration = header.last_duration;
            self.header.current_major_block = header.current_major_block;
            archive.store_header();
            archive.flush_index_async(block)?;
            block
        };

        metrics::counter!("fa_major_blocks_written_total").increment(1);
        debug!(block, timestamp, duration, id_zero = self.id_zero, "Major block complete");
        self.fa_offset = 0;
        self.d_offset = 0;
        self.timestamps.clear();
        Ok(())
    }

    /// Discards the partial major block.
    fn reset(&mut self) {
        if self.fa_offset > 0 {
            debug!(samples = self.fa_offset, "Gap: partial major block discarded");
        }
        self.fa_offset = 0;
        self.d_offset = 0;
        self.timestamps.clear();
        self.dd_pending = 0;
        for acc in &mut self.dd_accumulators {
            acc.reset();
        }
        self.dd_offset = self.header.current_major_block * self.header.dd_sample_count;
    }
}
