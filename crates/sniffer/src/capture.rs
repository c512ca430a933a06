//! Capture thread: frame source to block buffer

use crate::{FrameSource, SnifferError, SnifferStatus, SourceControl};
use fa_ring_buffer::{BlockWriter, Release};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Current time in microseconds since the epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

pub struct CaptureThread {
    running: Arc<AtomicBool>,
    control: Arc<dyn SourceControl>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureThread {
    /// Starts capturing from `source` into the buffer behind `writer`.
    /// After a failed read the source is reset once `retry_interval` has
    /// passed.
    pub fn start(
        mut source: Box<dyn FrameSource>,
        mut writer: BlockWriter,
        retry_interval: Duration,
    ) -> Result<Self, SnifferError> {
        let control = source.control();
        let running = Arc::new(AtomicBool::new(true));
        let handle = std::thread::Builder::new().name("sniffer".into()).spawn({
            let running = running.clone();
            move || capture_loop(source.as_mut(), &mut writer, &running, retry_interval)
        })?;
        info!("Sniffer started");
        Ok(Self {
            running,
            control,
            handle: Some(handle),
        })
    }

    /// Shared handle for status and interrupt requests.
    pub fn control(&self) -> Arc<dyn SourceControl> {
        self.control.clone()
    }

    pub fn status(&self) -> Result<SnifferStatus, SnifferError> {
        self.control.status()
    }

    pub fn interrupt(&self) -> Result<(), SnifferError> {
        info!("Interrupting sniffer");
        self.control.interrupt()
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            info!("Waiting for sniffer");
            if handle.join().is_err() {
                error!("Sniffer thread panicked");
            }
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.halt();
    }
}

fn capture_loop(
    source: &mut dyn FrameSource,
    writer: &mut BlockWriter,
    running: &AtomicBool,
    retry_interval: Duration,
) {
    let mut in_gap = false;
    while running.load(Ordering::Acquire) {
        let result = source.read_block(writer.get_write_block());
        let delivered = matches!(result, Ok(true));
        let release = writer.release_write_block(!delivered, now_micros());
        if release != Release::Advanced {
            metrics::counter!("fa_buffer_gaps_total").increment(1);
        }

        match result {
            Ok(true) => {
                if release == Release::Blocked {
                    warn!("Sniffer unable to write block");
                }
                if in_gap {
                    info!("Block read successfully");
                    in_gap = false;
                }
            }
            Ok(false) | Err(_) => {
                if let Err(err) = &result {
                    error!(error = %err, "Sniffer read failed");
                } else if !in_gap {
                    warn!("Unable to read block");
                }
                in_gap = true;
                pause(running, retry_interval);
                if let Err(err) = source.reset() {
                    error!(error = %err, "Sniffer reset failed");
                }
            }
        }
    }
    info!("Sniffer stopped");
}

/// Sleeps for `interval` unless stopped first.
fn pause(running: &AtomicBool, interval: Duration) {
    const SLICE: Duration = Duration::from_millis(50);
    let mut left = interval;
    while !left.is_zero() && running.load(Ordering::Acquire) {
        let step = left.min(SLICE);
        std::thread::sleep(step);
        left -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DummySource;
    use fa_format::FaEntry;
    use fa_ring_buffer::{BlockBuffer, ReadBlock};
    use std::time::Instant;

    const ENTRIES: u32 = 16;
    const FRAMES: usize = 4;

    fn start(buffer: &BlockBuffer) -> CaptureThread {
        let source = DummySource::new(ENTRIES, None, Duration::from_micros(100));
        CaptureThread::start(
            Box::new(source),
            buffer.take_writer().unwrap(),
            Duration::from_millis(10),
        )
        .unwrap()
    }

    #[test]
    fn test_capture_fills_buffer() {
        let buffer = BlockBuffer::new(FRAMES * ENTRIES as usize * FaEntry::SIZE, 16).unwrap();
        let mut reader = buffer.open_reader(false);
        let capture = start(&buffer);
        assert_eq!(capture.status().unwrap().running, 1);

        let mut blocks = 0;
        let mut last_timestamp = 0;
        let deadline = Instant::now() + Duration::from_secs(10);
        while blocks < 5 && Instant::now() < deadline {
            if let ReadBlock::Data {
                block, timestamp, ..
            } = reader.get_read_block(Duration::from_secs(1))
            {
                let first = FaEntry::read_from(block).x;
                for frame in 1..FRAMES {
                    let at = frame * ENTRIES as usize * FaEntry::SIZE;
                    assert_eq!(FaEntry::read_from(&block[at..]).x, first + frame as i32);
                }
                assert!(timestamp > last_timestamp);
                last_timestamp = timestamp;
                reader.release_read_block();
                blocks += 1;
            }
        }
        assert_eq!(blocks, 5);
        capture.stop();
    }

    #[test]
    fn test_interrupt_leaves_gap() {
        let buffer = BlockBuffer::new(FRAMES * ENTRIES as usize * FaEntry::SIZE, 16).unwrap();
        let mut reader = buffer.open_reader(false);
        let capture = start(&buffer);

        capture.interrupt().unwrap();
        let mut saw_gap = false;
        let mut data_after_gap = false;
        let deadline = Instant::now() + Duration::from_secs(10);
        while !data_after_gap && Instant::now() < deadline {
            match reader.get_read_block(Duration::from_secs(1)) {
                ReadBlock::Gap => saw_gap = true,
                ReadBlock::Data { .. } => {
                    reader.release_read_block();
                    data_after_gap = saw_gap;
                }
                _ => {}
            }
        }
        assert!(saw_gap && data_after_gap);
        drop(capture);
    }
}
