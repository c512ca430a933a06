//! Block Ring Buffer Implementation

use crate::{BufferError, PageBuffer};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default number of blocks in the capture buffer
pub const DEFAULT_BLOCK_COUNT: usize = 64;

/// How long a reader waits for data before reporting a timeout
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

type ReaderId = u64;

/// Per block metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// A gap precedes the data in this block
    pub gap: bool,
    /// Capture time of the block in microseconds
    pub timestamp: u64,
}

/// Result of releasing the write block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Block published, write pointer advanced
    Advanced,
    /// Gap recorded, either requested or because writes are disabled
    Gap,
    /// A reserved reader occupies the next block; gap recorded instead
    Blocked,
}

/// Result of waiting for the next block
#[derive(Debug)]
pub enum ReadBlock<'a> {
    /// Next block of data.  `backlog` is the largest number of bytes the
    /// reader has been behind the writer since the previous report.
    Data {
        block: &'a [u8],
        timestamp: u64,
        backlog: usize,
    },
    /// Data is missing here: either a gap was written or this reader was
    /// overrun and has been moved to the write pointer.  Do not release.
    Gap,
    /// Reader has been stopped
    Stopped,
    /// Nothing arrived within the timeout
    TimedOut,
}

#[derive(Debug)]
struct ReaderState {
    index_out: usize,
    underflowed: bool,
    gap_reported: bool,
    backlog: usize,
    running: bool,
    reserved: bool,
}

#[derive(Debug)]
struct State {
    index_in: usize,
    frame_info: Vec<FrameInfo>,
    readers: HashMap<ReaderId, ReaderState>,
    next_reader: ReaderId,
}

struct Shared {
    block_size: usize,
    block_count: usize,
    base: NonNull<u8>,
    _storage: PageBuffer,
    state: Mutex<State>,
    signal: Condvar,
    write_blocked: AtomicBool,
    writer_taken: AtomicBool,
}

// SAFETY: block memory is only written through the single BlockWriter at
// index_in and only read by readers at index_out != index_in.  An ordinary
// reader that is lapped may see its block rewritten; that reader is flagged
// as underflowed and release_read_block() tells it to discard the block.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn block_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.block_count);
        // SAFETY: index < block_count so the offset stays inside storage
        unsafe { self.base.as_ptr().add(index * self.block_size) }
    }

    fn advance(&self, index: usize) -> usize {
        (index + 1) % self.block_count
    }
}

/// Ring of fixed size blocks shared between one writer and many readers
#[derive(Clone)]
pub struct BlockBuffer {
    shared: Arc<Shared>,
}

impl BlockBuffer {
    /// Allocates `block_count` page aligned blocks of `block_size` bytes.
    pub fn new(block_size: usize, block_count: usize) -> Result<Self, BufferError> {
        if block_size == 0 || block_count < 2 {
            return Err(BufferError::InvalidGeometry {
                block_size,
                block_count,
            });
        }
        let total = block_size
            .checked_mul(block_count)
            .ok_or(BufferError::Allocation(usize::MAX))?;
        let storage = PageBuffer::zeroed(total)?;
        let base = storage.base();
        debug!(block_size, block_count, "Block buffer created");
        Ok(Self {
            shared: Arc::new(Shared {
                block_size,
                block_count,
                base,
                _storage: storage,
                state: Mutex::new(State {
                    index_in: 0,
                    frame_info: vec![FrameInfo::default(); block_count],
                    readers: HashMap::new(),
                    next_reader: 0,
                }),
                signal: Condvar::new(),
                write_blocked: AtomicBool::new(false),
                writer_taken: AtomicBool::new(false),
            }),
        })
    }

    /// Hands out the one and only writer for this buffer.
    pub fn take_writer(&self) -> Result<BlockWriter, BufferError> {
        if self.shared.writer_taken.swap(true, Ordering::AcqRel) {
            return Err(BufferError::WriterTaken);
        }
        Ok(BlockWriter {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Opens a reader positioned at the write pointer: it only sees new data.
    pub fn open_reader(&self, reserved: bool) -> BlockReader {
        let mut state = self.shared.state.lock();
        let id = state.next_reader;
        state.next_reader += 1;
        let index_out = state.index_in;
        state.readers.insert(
            id,
            ReaderState {
                index_out,
                underflowed: false,
                gap_reported: false,
                backlog: 0,
                running: true,
                reserved,
            },
        );
        BlockReader {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    pub fn block_count(&self) -> usize {
        self.shared.block_count
    }

    /// Current write pointer.
    pub fn write_index(&self) -> usize {
        self.shared.state.lock().index_in
    }

    /// Snapshot of the metadata for one block.
    pub fn frame_info(&self, index: usize) -> FrameInfo {
        self.shared.state.lock().frame_info[index]
    }

    /// Number of currently open readers.
    pub fn reader_count(&self) -> usize {
        self.shared.state.lock().readers.len()
    }

    /// While disabled every release of the write block records a gap.
    pub fn enable_buffer_write(&self, enabled: bool) {
        self.shared.write_blocked.store(!enabled, Ordering::Release);
    }

    pub fn buffer_write_enabled(&self) -> bool {
        !self.shared.write_blocked.load(Ordering::Acquire)
    }
}

/// Exclusive write access to a [`BlockBuffer`]
pub struct BlockWriter {
    shared: Arc<Shared>,
}

impl BlockWriter {
    /// Returns the block at the write pointer to be filled in place.
    pub fn get_write_block(&mut self) -> &mut [u8] {
        let index = self.shared.state.lock().index_in;
        // SAFETY: only this writer writes, and only ever at index_in which no
        // unlapped reader is reading (see Shared)
        unsafe { std::slice::from_raw_parts_mut(self.shared.block_ptr(index), self.shared.block_size) }
    }

    /// Publishes the write block, or records a gap before it.
    pub fn release_write_block(&mut self, gap: bool, timestamp: u64) -> Release {
        let shared = &*self.shared;
        let gap = gap || shared.write_blocked.load(Ordering::Acquire);

        let mut state = shared.state.lock();
        let index_in = state.index_in;
        let outcome = if gap {
            state.frame_info[index_in].gap = true;
            Release::Gap
        } else {
            let new_index = shared.advance(index_in);
            let blocked = state
                .readers
                .values()
                .any(|r| r.reserved && r.index_out == new_index);
            if blocked {
                state.frame_info[index_in].gap = true;
                Release::Blocked
            } else {
                state.frame_info[index_in].timestamp = timestamp;
                state.frame_info[new_index].gap = false;
                state.index_in = new_index;

                let count = shared.block_count;
                let block_size = shared.block_size;
                for reader in state.readers.values_mut() {
                    if reader.index_out == new_index {
                        // Reserved readers cannot be here, see above
                        reader.underflowed = true;
                    } else {
                        let behind = (index_in + count - reader.index_out) % count;
                        reader.backlog = reader.backlog.max(behind * block_size);
                    }
                }
                Release::Advanced
            }
        };
        shared.signal.notify_all();
        outcome
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    /// Whether releases are currently forced to gaps.
    pub fn write_enabled(&self) -> bool {
        !self.shared.write_blocked.load(Ordering::Acquire)
    }
}

/// Handle for stopping a reader from another thread
#[derive(Clone)]
pub struct ReaderStop {
    shared: Arc<Shared>,
    id: ReaderId,
}

impl ReaderStop {
    /// Wakes the reader and makes every later read return [`ReadBlock::Stopped`].
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if let Some(reader) = state.readers.get_mut(&self.id) {
            reader.running = false;
        }
        self.shared.signal.notify_all();
    }
}

enum Poll {
    Wait,
    Stopped,
    Gap,
    Data {
        index: usize,
        timestamp: u64,
        backlog: usize,
    },
}

fn poll_reader(state: &mut State, id: ReaderId) -> Poll {
    let index_in = state.index_in;
    let Some(reader) = state.readers.get_mut(&id) else {
        return Poll::Stopped;
    };
    if !reader.running {
        return Poll::Stopped;
    }
    if reader.underflowed {
        reader.underflowed = false;
        reader.index_out = index_in;
        reader.backlog = 0;
        reader.gap_reported = true;
        return Poll::Gap;
    }
    let info = state.frame_info[reader.index_out];
    if info.gap && !reader.gap_reported {
        reader.gap_reported = true;
        return Poll::Gap;
    }
    if reader.index_out == index_in {
        return Poll::Wait;
    }
    reader.gap_reported = false;
    Poll::Data {
        index: reader.index_out,
        timestamp: info.timestamp,
        backlog: std::mem::take(&mut reader.backlog),
    }
}

/// Independent consumer of a [`BlockBuffer`].  Dropping it closes the reader.
pub struct BlockReader {
    shared: Arc<Shared>,
    id: ReaderId,
}

impl BlockReader {
    /// Waits up to `timeout` for the next block.
    pub fn get_read_block(&mut self, timeout: Duration) -> ReadBlock<'_> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        let deadline = Instant::now() + timeout;
        let mut waited = false;
        loop {
            match poll_reader(&mut state, self.id) {
                Poll::Wait if waited => {
                    if !timeout.is_zero() {
                        warn!(timeout_ms = timeout.as_millis() as u64, "Timeout waiting for circular buffer");
                    }
                    return ReadBlock::TimedOut;
                }
                Poll::Wait => {
                    waited = shared.signal.wait_until(&mut state, deadline).timed_out();
                }
                Poll::Stopped => return ReadBlock::Stopped,
                Poll::Gap => return ReadBlock::Gap,
                Poll::Data {
                    index,
                    timestamp,
                    backlog,
                } => {
                    drop(state);
                    // SAFETY: index != index_in so the writer is elsewhere;
                    // if it laps us the underflow flag reports it on release
                    let block = unsafe {
                        std::slice::from_raw_parts(shared.block_ptr(index), shared.block_size)
                    };
                    return ReadBlock::Data {
                        block,
                        timestamp,
                        backlog,
                    };
                }
            }
        }
    }

    /// Moves on to the next block.  Returns false if the block just read was
    /// overwritten while being read; the next read then reports a gap.
    pub fn release_read_block(&mut self) -> bool {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        match state.readers.get_mut(&self.id) {
            Some(reader) if !reader.underflowed => {
                reader.index_out = shared.advance(reader.index_out);
                true
            }
            _ => false,
        }
    }

    /// Handle that can stop this reader from another thread.
    pub fn stop_handle(&self) -> ReaderStop {
        ReaderStop {
            shared: Arc::clone(&self.shared),
            id: self.id,
        }
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    pub fn is_reserved(&self) -> bool {
        self.shared
            .state
            .lock()
            .readers
            .get(&self.id)
            .map_or(false, |r| r.reserved)
    }

    /// Block this reader will read next.
    pub fn index_out(&self) -> usize {
        self.shared
            .state
            .lock()
            .readers
            .get(&self.id)
            .map_or(0, |r| r.index_out)
    }
}

impl Drop for BlockReader {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.readers.remove(&self.id);
    }
}
