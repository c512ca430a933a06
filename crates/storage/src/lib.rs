//! Archive Storage
//!
//! Opens, locks and maps the archive file, prepares new archives and runs the
//! disk writer thread which carries completed major blocks to disk.

mod archive;
mod prepare;
mod writer;

pub use archive::Archive;
pub use prepare::{load_header, prepare_archive, read_index_entry, write_header_dump, write_index_dump};
pub use writer::DiskWriter;

use fa_format::FormatError;
use fa_ring_buffer::BufferError;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("Unable to lock archive for access: already running?")]
    Locked,

    #[error("Must specify file size for new archive")]
    SizeRequired,

    /// The disk writer hit an I/O error; it will not write again
    #[error("Disk writer failed: {0}")]
    WriteFailed(String),

    #[error("Disk writer has shut down")]
    WriterStopped,
}

/// Opens the archive at `path` together with its disk writer.
pub fn open_archive(
    path: impl AsRef<Path>,
    direct_io: bool,
) -> Result<(Archive, DiskWriter), StorageError> {
    let archive = Archive::open(path.as_ref())?;
    let writer = DiskWriter::start(path.as_ref(), direct_io)?;
    Ok((archive, writer))
}
