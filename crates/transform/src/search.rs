//! Timestamp search over the major block index
//!
//! The index is a ring of `major_block_count` entries.  The entry at
//! `current_major_block` is being filled and is never trusted; entries with a
//! zero duration have never been written and mark the start of the archive.

use fa_format::DataIndex;
use fa_storage::Archive;
use thiserror::Error;

/// Blocks after the current block skipped by the binary search.
pub const INDEX_SKIP: u32 = 2;

/// Largest timestamp discontinuity between adjacent blocks not counted as a
/// gap, in microseconds.
pub const MAX_DELTA_T: i64 = 1000;

/// Read access to the block index
pub trait IndexAccess {
    fn block_count(&self) -> u32;
    fn current_block(&self) -> u32;
    fn major_sample_count(&self) -> u32;
    fn entry(&self, block: u32) -> DataIndex;
}

impl IndexAccess for Archive {
    fn block_count(&self) -> u32 {
        self.header().major_block_count
    }

    fn current_block(&self) -> u32 {
        self.header().current_major_block
    }

    fn major_sample_count(&self) -> u32 {
        self.header().major_sample_count
    }

    fn entry(&self, block: u32) -> DataIndex {
        self.index_entry(block)
    }
}

/// Sample position in the archive: major block and FA sample offset into it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexPosition {
    pub block: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    #[error("Start time too late")]
    StartTooLate,

    #[error("Start time too early")]
    StartTooEarly,

    #[error("Start time in data gap")]
    StartInGap,

    #[error("End time too late")]
    EndTooLate,

    #[error("No data in selected range")]
    NoData,
}

/// Finds the latest block starting no later than `timestamp`.
///
/// The current block is never inspected.  Also returns whether the block
/// found is the first in the archive, to help report requests which start
/// too early.
pub fn binary_search(index: &impl IndexAccess, timestamp: u64) -> (u32, bool) {
    let n = index.block_count();
    let current = index.current_block();
    let start = (current + 1 + INDEX_SKIP) % n;
    let mut low = start;
    let mut high = current;
    while (low + 1) % n != high {
        let mid = if low < high {
            (low + high) / 2
        } else {
            ((low + high + n) / 2) % n
        };
        if timestamp < index.entry(mid).timestamp {
            high = mid;
        } else {
            low = mid;
        }
    }

    let low_duration = index.entry(low).duration;
    let first_block = low_duration == 0 || low == start;
    if low_duration == 0 {
        (high, first_block)
    } else {
        (low, first_block)
    }
}

/// Start time of the block containing `timestamp`.
pub fn timestamp_to_index_ts(index: &impl IndexAccess, timestamp: u64) -> u64 {
    index.entry(binary_search(index, timestamp).0).timestamp
}

/// Converts a timestamp into a block and sample offset.  A timestamp falling
/// after the end of its block either moves on to the next block
/// (`skip_gap`) or is clamped to the last sample of the block.
fn timestamp_to_block(
    index: &impl IndexAccess,
    timestamp: u64,
    skip_gap: bool,
) -> (IndexPosition, bool) {
    let (mut block, mut first_block) = binary_search(index, timestamp);
    let entry = index.entry(block);
    let block_size = index.major_sample_count();
    let duration = entry.duration as u64;
    let offset = if timestamp < entry.timestamp {
        0
    } else if timestamp - entry.timestamp < duration {
        ((timestamp - entry.timestamp) * block_size as u64 / duration) as u32
    } else if skip_gap {
        block = (block + 1) % index.block_count();
        first_block = false;
        0
    } else {
        block_size - 1
    };
    (IndexPosition { block, offset }, first_block)
}

/// FA samples from `position` up to the current block.
pub fn samples_available(index: &impl IndexAccess, position: IndexPosition) -> u64 {
    let current = index.current_block();
    let blocks = if current >= position.block {
        current - position.block
    } else {
        index.block_count() - position.block + current
    };
    blocks as u64 * index.major_sample_count() as u64 - position.offset as u64
}

/// Locates the first sample at or after `timestamp` and counts the FA
/// samples available from there.
pub fn timestamp_to_start(
    index: &impl IndexAccess,
    timestamp: u64,
    all_data: bool,
) -> Result<(IndexPosition, u64), SearchError> {
    let (position, first_block) = timestamp_to_block(index, timestamp, true);
    if position.block == index.current_block() {
        return Err(SearchError::StartTooLate);
    }
    if !all_data && index.entry(position.block).timestamp > timestamp {
        return Err(if first_block {
            SearchError::StartTooEarly
        } else {
            SearchError::StartInGap
        });
    }
    Ok((position, samples_available(index, position)))
}

/// Locates the sample at `timestamp` as the end of a range starting in
/// `start_block`.
pub fn timestamp_to_end(
    index: &impl IndexAccess,
    timestamp: u64,
    all_data: bool,
    start_block: u32,
) -> Result<IndexPosition, SearchError> {
    let current = index.current_block();
    let (position, _) = timestamp_to_block(index, timestamp, false);
    let entry = index.entry(position.block);
    let end_timestamp = entry.timestamp + entry.duration as u64;
    if !all_data && timestamp > end_timestamp {
        return Err(SearchError::EndTooLate);
    }
    // The end can only precede the start if the current block lies between
    let block = position.block;
    if block >= start_block || (block < current && current < start_block) {
        Ok(position)
    } else {
        Err(SearchError::NoData)
    }
}

/// A run of consecutive index blocks being scanned for gaps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRun {
    /// Block last inspected
    pub block: u32,
    /// Blocks in the run from `block` onwards
    pub remaining: u32,
}

/// Advances `run` to the next block which does not follow on from its
/// predecessor, returning false if the run ends first.
///
/// Blocks follow on when the timestamp is within [`MAX_DELTA_T`] of the end
/// of the previous block and, with `check_id0`, id_zero advanced by exactly
/// one major block of samples.
pub fn find_gap(index: &impl IndexAccess, check_id0: bool, run: &mut BlockRun) -> bool {
    let n = index.block_count();
    let step = index.major_sample_count();
    let entry = index.entry(run.block);
    let mut timestamp = entry.timestamp + entry.duration as u64;
    let mut id_zero = entry.id_zero.wrapping_add(step);
    while run.remaining > 1 {
        run.remaining -= 1;
        run.block = (run.block + 1) % n;

        let entry = index.entry(run.block);
        let delta_t = entry.timestamp.wrapping_sub(timestamp) as i64;
        if (check_id0 && entry.id_zero != id_zero) || !(-MAX_DELTA_T..=MAX_DELTA_T).contains(&delta_t)
        {
            return true;
        }
        timestamp = entry.timestamp + entry.duration as u64;
        id_zero = entry.id_zero.wrapping_add(step);
    }
    false
}
