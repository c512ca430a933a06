//! Frame source abstraction

use crate::SnifferError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Hardware style status report, returned by the `CS` command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnifferStatus {
    /// Link status: 1 ok, 2 or 3 link fault
    pub status: u32,
    /// Link partner, 1023 if not connected
    pub partner: u32,
    /// Last interrupt code, 1 when running normally
    pub last_interrupt: u32,
    pub frame_errors: u32,
    pub soft_errors: u32,
    pub hard_errors: u32,
    /// 1 while fetching data
    pub running: u32,
    /// 1 if halted by a buffer overrun
    pub overrun: u32,
}

impl fmt::Display for SnifferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {} {}",
            self.status,
            self.partner,
            self.last_interrupt,
            self.frame_errors,
            self.soft_errors,
            self.hard_errors,
            self.running,
            self.overrun
        )
    }
}

/// Source of whole blocks of FA frames, driven by the capture thread
pub trait FrameSource: Send {
    /// Fills `block` with frames.  `Ok(false)` means no data could be
    /// delivered and a gap must be recorded.
    fn read_block(&mut self, block: &mut [u8]) -> Result<bool, SnifferError>;

    /// Restarts acquisition after a gap or error.
    fn reset(&mut self) -> Result<(), SnifferError>;

    /// Handle for status and interrupt requests from other threads.
    fn control(&self) -> std::sync::Arc<dyn SourceControl>;
}

/// Out of band access to a running source
pub trait SourceControl: Send + Sync {
    fn status(&self) -> Result<SnifferStatus, SnifferError>;

    /// Halts acquisition until the next reset.
    fn interrupt(&self) -> Result<(), SnifferError>;
}

/// Control state for sources without hardware behind them
#[derive(Debug, Default)]
pub struct SoftControl {
    interrupted: AtomicBool,
    running: AtomicBool,
    frame_errors: AtomicU32,
}

impl SoftControl {
    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Clears an interrupt, returning whether one was pending.
    pub fn clear_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    pub fn frame_error(&self) {
        self.frame_errors.fetch_add(1, Ordering::Relaxed);
    }
}

impl SourceControl for SoftControl {
    fn status(&self) -> Result<SnifferStatus, SnifferError> {
        let interrupted = self.interrupted();
        Ok(SnifferStatus {
            status: 1,
            partner: 0,
            last_interrupt: if interrupted { 2 } else { 1 },
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            soft_errors: 0,
            hard_errors: 0,
            running: u32::from(self.running.load(Ordering::Acquire) && !interrupted),
            overrun: 0,
        })
    }

    fn interrupt(&self) -> Result<(), SnifferError> {
        self.interrupted.store(true, Ordering::Release);
        Ok(())
    }
}

/// Paces a synthetic source at a fixed frame interval
#[derive(Debug)]
pub(crate) struct Pacer {
    interval: Duration,
    next: Instant,
}

impl Pacer {
    /// Falling further behind than this restarts the schedule
    const MAX_LAG: Duration = Duration::from_secs(1);

    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    pub(crate) fn restart(&mut self) {
        self.next = Instant::now();
    }

    /// Sleeps until `frames` frame intervals after the previous deadline.
    pub(crate) fn wait(&mut self, frames: usize) {
        self.next += self.interval * frames as u32;
        let now = Instant::now();
        if self.next > now {
            std::thread::sleep(self.next - now);
        } else if now - self.next > Self::MAX_LAG {
            self.next = now;
        }
    }
}
