//! Disk writer thread
//!
//! Completed major blocks are handed over one at a time and written at their
//! file offset by a dedicated thread.  At most one write is queued or in
//! flight; readers of the major data area rendezvous with the writer through
//! [`DiskWriter::request_read`] before touching a block which may still be in
//! transit.

use crate::StorageError;
use fa_ring_buffer::PageBuffer;
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info};

struct WriteRequest {
    offset: u64,
    buffer: PageBuffer,
}

struct WriterState {
    request: Option<WriteRequest>,
    in_flight: bool,
    completed: Option<PageBuffer>,
    error: Option<String>,
    enabled: bool,
    running: bool,
}

impl WriterState {
    fn busy(&self) -> bool {
        self.request.is_some() || self.in_flight
    }

    fn check(&self) -> Result<(), StorageError> {
        match &self.error {
            Some(message) => Err(StorageError::WriteFailed(message.clone())),
            None => Ok(()),
        }
    }
}

struct Shared {
    state: Mutex<WriterState>,
    signal: Condvar,
}

/// Handle to the disk writer thread
pub struct DiskWriter {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

#[cfg(target_os = "linux")]
fn set_direct_io(options: &mut OpenOptions) {
    use std::os::unix::fs::OpenOptionsExt;
    options.custom_flags(libc::O_DIRECT);
}

#[cfg(not(target_os = "linux"))]
fn set_direct_io(_options: &mut OpenOptions) {}

fn open_for_writing(path: &Path, direct_io: bool) -> Result<File, StorageError> {
    let mut options = OpenOptions::new();
    options.write(true);
    if direct_io {
        set_direct_io(&mut options);
    }
    Ok(options.open(path)?)
}

impl DiskWriter {
    /// Opens a write handle on `path` and starts the writer thread.
    pub fn start(path: &Path, direct_io: bool) -> Result<Self, StorageError> {
        let file = open_for_writing(path, direct_io)?;
        let shared = Arc::new(Shared {
            state: Mutex::new(WriterState {
                request: None,
                in_flight: false,
                completed: None,
                error: None,
                enabled: true,
                running: true,
            }),
            signal: Condvar::new(),
        });
        let thread = std::thread::Builder::new()
            .name("disk-writer".into())
            .spawn({
                let shared = shared.clone();
                move || writer_thread(shared, file)
            })?;
        info!(path = %path.display(), direct_io, "Disk writer started");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues `buffer` to be written at `offset`, waiting for any earlier
    /// write to finish first.
    pub fn schedule_write(&self, offset: u64, buffer: PageBuffer) -> Result<(), StorageError> {
        let mut state = self.shared.state.lock();
        while state.busy() && state.running {
            self.shared.signal.wait(&mut state);
        }
        state.check()?;
        if !state.running {
            return Err(StorageError::WriterStopped);
        }
        state.request = Some(WriteRequest { offset, buffer });
        self.shared.signal.notify_all();
        Ok(())
    }

    /// Waits for the pending write and returns the buffer it used, if any.
    pub fn reclaim(&self) -> Result<Option<PageBuffer>, StorageError> {
        let mut state = self.shared.state.lock();
        while state.busy() {
            self.shared.signal.wait(&mut state);
        }
        state.check()?;
        Ok(state.completed.take())
    }

    /// Waits until no write is queued or in flight.
    pub fn request_read(&self) -> Result<(), StorageError> {
        let mut state = self.shared.state.lock();
        while state.busy() {
            self.shared.signal.wait(&mut state);
        }
        state.check()
    }

    /// A disabled writer completes requests without touching the disk.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.lock();
        if state.enabled != enabled {
            info!(enabled, "Disk writing {}", if enabled { "enabled" } else { "disabled" });
        }
        state.enabled = enabled;
    }

    pub fn enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    /// Completes any pending write and joins the writer thread.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            self.shared.signal.notify_all();
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("Disk writer thread panicked");
            }
        }
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn writer_thread(shared: Arc<Shared>, file: File) {
    loop {
        let (request, enabled) = {
            let mut state = shared.state.lock();
            while state.request.is_none() && state.running {
                shared.signal.wait(&mut state);
            }
            match state.request.take() {
                Some(request) => {
                    state.in_flight = true;
                    (request, state.enabled)
                }
                None => break,
            }
        };

        let started = Instant::now();
        let result = if enabled {
            file.write_all_at(&request.buffer, request.offset)
        } else {
            Ok(())
        };
        metrics::histogram!("fa_disk_write_seconds").record(started.elapsed().as_secs_f64());

        let mut state = shared.state.lock();
        state.in_flight = false;
        state.completed = Some(request.buffer);
        match result {
            Ok(()) => debug!(offset = request.offset, enabled, "Major block written"),
            Err(err) => {
                error!(offset = request.offset, error = %err, "Error writing to archive");
                state.error.get_or_insert_with(|| err.to_string());
            }
        }
        shared.signal.notify_all();
    }
    debug!("Disk writer stopped");
}
