//! FA Archive Reader
//!
//! Serves historical `R` requests: resolves the requested time range
//! against the block index, checks availability and contiguity, then
//! streams the selected channels block by block through a bounded pool of
//! read buffers.

mod pool;
mod read;

pub use pool::{BufferPool, PoolLease};
pub use read::{QueryEngine, DEFAULT_POOL_SIZE};

use fa_protocol::ProtocolError;
use fa_storage::StorageError;
use fa_transform::SearchError;
use thiserror::Error;

/// Read request failures.  The display text is what the client sees.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("BPM {0} not in archive")]
    NotArchived(u32),

    #[error("Time range runs backwards")]
    RunsBackwards,

    #[error("No samples in selected range")]
    NoSamples,

    #[error("Only {available} samples of {requested} requested available")]
    Insufficient { available: u64, requested: u64 },

    #[error("Only {0} contiguous samples available")]
    NotContiguous(u64),

    #[error("Read too busy")]
    Busy,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Error sending data: {0}")]
    Io(#[from] std::io::Error),
}

impl QueryError {
    /// True for errors caused by the request rather than the server.
    pub fn is_request_error(&self) -> bool {
        !matches!(self, Self::Storage(_) | Self::Io(_))
    }
}
