//! Transform thread: drains a reserved buffer reader into the engine

use crate::{TransformEngine, TransformError};
use fa_ring_buffer::{BlockBuffer, BlockReader, ReadBlock, ReaderStop, READ_TIMEOUT};
use std::thread::JoinHandle;
use tracing::{error, info};

pub struct TransformThread {
    stop: ReaderStop,
    handle: Option<JoinHandle<Result<(), TransformError>>>,
}

impl TransformThread {
    /// Opens a reserved reader on `buffer` and starts feeding `engine`.
    pub fn start(mut engine: TransformEngine, buffer: &BlockBuffer) -> Result<Self, TransformError> {
        let mut reader = buffer.open_reader(true);
        let stop = reader.stop_handle();
        let handle = std::thread::Builder::new()
            .name("transform".into())
            .spawn(move || {
                let result = run(&mut engine, &mut reader);
                if let Err(err) = &result {
                    error!(error = %err, "Transform thread failed");
                }
                result
            })?;
        info!("Transform thread started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the reader and waits for the thread to finish.
    pub fn stop(mut self) -> Result<(), TransformError> {
        self.stop.stop();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| TransformError::Panicked)?,
            None => Ok(()),
        }
    }
}

fn run(engine: &mut TransformEngine, reader: &mut BlockReader) -> Result<(), TransformError> {
    loop {
        match reader.get_read_block(READ_TIMEOUT) {
            ReadBlock::Data {
                block, timestamp, ..
            } => {
                engine.process_block(Some((block, timestamp)))?;
                if !reader.release_read_block() {
                    engine.process_block(None)?;
                }
            }
            // A stall long enough to time out breaks the timestamp sequence
            ReadBlock::Gap | ReadBlock::TimedOut => engine.process_block(None)?,
            ReadBlock::Stopped => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fa_format::{FilterMask, PrepareParams};
    use fa_ring_buffer::Release;
    use fa_storage::{prepare_archive, Archive, DiskWriter};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_buffer_to_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive");
        let params = PrepareParams {
            input_block_size: 8 * 16 * 8,
            major_sample_count: 512,
            first_decimation: 4,
            second_decimation: 4,
            sample_frequency: 10000.0,
            timestamp_iir: 0.1,
            fa_entry_count: 16,
        };
        prepare_archive(&path, &FilterMask::from_ids([0, 1]), Some(1 << 20), &params, false)
            .unwrap();
        let archive = Arc::new(Mutex::new(Archive::open(&path).unwrap()));
        let writer = Arc::new(DiskWriter::start(&path, false).unwrap());
        let engine = TransformEngine::new(archive.clone(), writer.clone(), None).unwrap();

        let buffer = BlockBuffer::new(params.input_block_size as usize, 16).unwrap();
        let mut producer = buffer.take_writer().unwrap();
        let transform = TransformThread::start(engine, &buffer).unwrap();

        // Major blocks hold 64 input blocks
        let mut written = 0u64;
        let deadline = Instant::now() + Duration::from_secs(10);
        while archive.lock().header().current_major_block < 2 && Instant::now() < deadline {
            producer.get_write_block().fill(1);
            if producer.release_write_block(false, 1_000_000 + written * 800) == Release::Advanced {
                written += 1;
            }
            std::thread::sleep(Duration::from_micros(200));
        }

        transform.stop().unwrap();
        writer.shutdown();
        let archive = archive.lock();
        assert!(archive.header().current_major_block >= 2);
        assert_eq!(archive.index_entry(1).duration, 64 * 800);
        assert_eq!(buffer.reader_count(), 0);
    }
}
