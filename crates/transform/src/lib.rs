//! Transform and Indexing Engine
//!
//! Consumes input blocks from the ring buffer, transposes them into channel
//! major order, computes both stages of decimation, maintains the block
//! index and hands completed major blocks to the disk writer.  Also provides
//! timestamp search over the index.

mod engine;
mod search;
mod thread;

pub use engine::TransformEngine;
pub use search::{
    binary_search, find_gap, samples_available, timestamp_to_end, timestamp_to_index_ts,
    timestamp_to_start, BlockRun, IndexAccess, IndexPosition, SearchError, INDEX_SKIP,
    MAX_DELTA_T,
};
pub use thread::TransformThread;

use fa_ring_buffer::BufferError;
use fa_storage::{Archive, StorageError};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// The archive behind the transform lock.
///
/// Every index block except `current_major_block` is stable while this lock
/// is not held by the transform.
pub type SharedArchive = Arc<Mutex<Archive>>;

/// Transform errors
#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("Input block of {actual} bytes, expected {expected}")]
    BlockSize { actual: usize, expected: usize },

    #[error("Unable to start transform thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Transform thread panicked")]
    Panicked,
}
