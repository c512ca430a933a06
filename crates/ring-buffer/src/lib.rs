//! Block Ring Buffer
//!
//! Decouples the single frame producer from any number of consumers.  The
//! buffer is a ring of fixed size, page aligned blocks written in place by
//! one [`BlockWriter`] and read in place by independent [`BlockReader`]s.
//! Readers that fall a full lap behind are told so (underflow) rather than
//! silently skipping data; reserved readers are never overrun and force the
//! writer to record a gap instead.

mod aligned;
mod buffer;

pub use aligned::{PageBuffer, PAGE_SIZE};
pub use buffer::{
    BlockBuffer, BlockReader, BlockWriter, FrameInfo, ReadBlock, ReaderStop, Release,
    DEFAULT_BLOCK_COUNT, READ_TIMEOUT,
};

use thiserror::Error;

/// Block buffer errors
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Invalid buffer geometry: {block_count} blocks of {block_size} bytes")]
    InvalidGeometry { block_size: usize, block_count: usize },

    #[error("Unable to allocate {0} bytes of page aligned memory")]
    Allocation(usize),

    #[error("Buffer writer already taken")]
    WriterTaken,
}
