//! FA Frame Sniffer
//!
//! Frame sources deliver whole blocks of FA frames: a synthetic dummy
//! source and a replay of recorded frames.  The capture thread moves blocks
//! from a source into the block buffer, timestamping each one.

mod capture;
mod dummy;
mod replay;
mod source;

pub use capture::{now_micros, CaptureThread};
pub use dummy::DummySource;
pub use replay::ReplaySource;
pub use source::{FrameSource, SnifferStatus, SoftControl, SourceControl};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnifferError {
    #[error("Sniffer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Replay file {path} holds no whole frames")]
    EmptyReplay { path: String },

    #[error("Block of {0} bytes is not a whole number of frames")]
    PartialFrame(usize),

    #[error("Sniffer not running")]
    NotRunning,
}
