//! Synthetic frame source

use crate::source::Pacer;
use crate::{FrameSource, SnifferError, SoftControl, SourceControl};
use fa_format::FaEntry;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const AMPLITUDE: f64 = 50000.0;

/// Generates frames without hardware.
///
/// Id 0 carries a frame counter in both x and y, the events id is left at
/// zero and every other id carries a sine and cosine whose frequency rises
/// with the id.
pub struct DummySource {
    fa_entry_count: usize,
    events_fa_id: Option<u32>,
    counter: u32,
    pacer: Pacer,
    control: Arc<SoftControl>,
}

impl DummySource {
    pub fn new(fa_entry_count: u32, events_fa_id: Option<u32>, frame_interval: Duration) -> Self {
        let control = Arc::new(SoftControl::default());
        control.set_running(true);
        info!(fa_entry_count, ?frame_interval, "Dummy sniffer source");
        Self {
            fa_entry_count: fa_entry_count as usize,
            events_fa_id,
            counter: 0,
            pacer: Pacer::new(frame_interval),
            control,
        }
    }

    fn entry(&self, id: usize) -> FaEntry {
        if id == 0 {
            let count = self.counter as i32;
            return FaEntry::new(count, count);
        }
        if self.events_fa_id == Some(id as u32) {
            return FaEntry::default();
        }
        let int_phase = self.counter.wrapping_mul(id as u32).wrapping_mul(7000);
        let phase = 2.0 * PI * int_phase as f64 / (u32::MAX as f64 + 1.0);
        FaEntry::new(
            (AMPLITUDE * phase.sin()) as i32,
            (AMPLITUDE * phase.cos()) as i32,
        )
    }
}

impl FrameSource for DummySource {
    fn read_block(&mut self, block: &mut [u8]) -> Result<bool, SnifferError> {
        if self.control.interrupted() {
            return Ok(false);
        }
        let frame_size = self.fa_entry_count * FaEntry::SIZE;
        if block.len() % frame_size != 0 {
            return Err(SnifferError::PartialFrame(block.len()));
        }
        let frames = block.len() / frame_size;
        for frame in block.chunks_exact_mut(frame_size) {
            for (id, bytes) in frame.chunks_exact_mut(FaEntry::SIZE).enumerate() {
                self.entry(id).write_to(bytes);
            }
            self.counter = self.counter.wrapping_add(1);
        }
        self.pacer.wait(frames);
        Ok(true)
    }

    fn reset(&mut self) -> Result<(), SnifferError> {
        if self.control.clear_interrupt() {
            info!("Dummy sniffer restarted after interrupt");
        }
        self.pacer.restart();
        Ok(())
    }

    fn control(&self) -> Arc<dyn SourceControl> {
        self.control.clone()
    }
}
