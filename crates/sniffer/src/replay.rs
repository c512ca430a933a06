//! Replay of recorded frames

use crate::source::Pacer;
use crate::{FrameSource, SnifferError, SoftControl, SourceControl};
use fa_format::FaEntry;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Loops over a file of raw little endian frames.
///
/// Id 0 is rewritten with a counter that restarts from the first recorded
/// value each time the file wraps, so the recording carries its own
/// id_zero discontinuity at the loop point.
pub struct ReplaySource {
    frames: Vec<u8>,
    frame_size: usize,
    frame_count: usize,
    index: usize,
    id_zero_start: u32,
    id_zero: u32,
    pacer: Pacer,
    control: Arc<SoftControl>,
}

impl ReplaySource {
    pub fn open(
        path: &Path,
        fa_entry_count: u32,
        frame_interval: Duration,
    ) -> Result<Self, SnifferError> {
        let mut frames = std::fs::read(path)?;
        let frame_size = fa_entry_count as usize * FaEntry::SIZE;
        let frame_count = frames.len() / frame_size;
        if frame_count == 0 {
            return Err(SnifferError::EmptyReplay {
                path: path.display().to_string(),
            });
        }
        frames.truncate(frame_count * frame_size);
        let id_zero_start = FaEntry::read_from(&frames).x as u32;
        info!(path = %path.display(), frame_count, "Replaying recorded frames");

        let control = Arc::new(SoftControl::default());
        control.set_running(true);
        Ok(Self {
            frames,
            frame_size,
            frame_count,
            index: 0,
            id_zero_start,
            id_zero: id_zero_start,
            pacer: Pacer::new(frame_interval),
            control,
        })
    }
}

impl FrameSource for ReplaySource {
    fn read_block(&mut self, block: &mut [u8]) -> Result<bool, SnifferError> {
        if self.control.interrupted() {
            return Ok(false);
        }
        if block.len() % self.frame_size != 0 {
            return Err(SnifferError::PartialFrame(block.len()));
        }
        let frames = block.len() / self.frame_size;
        for frame in block.chunks_exact_mut(self.frame_size) {
            let at = self.index * self.frame_size;
            frame.copy_from_slice(&self.frames[at..at + self.frame_size]);
            let id_zero = self.id_zero as i32;
            FaEntry::new(id_zero, id_zero).write_to(frame);

            self.index += 1;
            if self.index < self.frame_count {
                self.id_zero = self.id_zero.wrapping_add(1);
            } else {
                self.index = 0;
                self.id_zero = self.id_zero_start;
            }
        }
        self.pacer.wait(frames);
        Ok(true)
    }

    fn reset(&mut self) -> Result<(), SnifferError> {
        self.control.clear_interrupt();
        self.pacer.restart();
        Ok(())
    }

    fn control(&self) -> Arc<dyn SourceControl> {
        self.control.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn recording(frames: &[[i32; 4]]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for frame in frames {
            for (id, &value) in frame.iter().enumerate() {
                let mut bytes = [0u8; FaEntry::SIZE];
                FaEntry::new(value, -(id as i32)).write_to(&mut bytes);
                file.write_all(&bytes).unwrap();
            }
        }
        // A trailing partial frame is ignored
        file.write_all(&[1, 2, 3]).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_replay_wraps() {
        let file = recording(&[[100, 1, 2, 3], [0, 11, 12, 13], [0, 21, 22, 23]]);
        let mut source = ReplaySource::open(file.path(), 4, Duration::from_micros(1)).unwrap();
        let mut block = vec![0u8; 4 * 4 * FaEntry::SIZE];
        assert!(source.read_block(&mut block).unwrap());

        let frame = |n: usize, id: usize| FaEntry::read_from(&block[(n * 4 + id) * FaEntry::SIZE..]);
        assert_eq!(frame(0, 0), FaEntry::new(100, 100));
        assert_eq!(frame(1, 0), FaEntry::new(101, 101));
        assert_eq!(frame(2, 0), FaEntry::new(102, 102));
        assert_eq!(frame(3, 0), FaEntry::new(100, 100));
        assert_eq!(frame(1, 2), FaEntry::new(12, -2));
        assert_eq!(frame(3, 3), FaEntry::new(3, -3));
    }

    #[test]
    fn test_empty_recording() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            ReplaySource::open(file.path(), 4, Duration::from_micros(1)),
            Err(SnifferError::EmptyReplay { .. })
        ));
    }
}
