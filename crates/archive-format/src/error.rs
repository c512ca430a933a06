//! Archive Format Error Types

use thiserror::Error;

/// Errors raised while computing, decoding or validating archive layout
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormatError {
    /// Header page does not start with the archive signature
    #[error("Invalid header signature")]
    BadSignature,

    /// Header written by an incompatible version
    #[error("Invalid header version {0}")]
    BadVersion(u32),

    /// A capture parameter which must be a power of two is not
    #[error("{name} must be a power of 2, not {value}")]
    NotPowerOfTwo { name: &'static str, value: u32 },

    /// One of the derived layout checks failed
    #[error("Header check failed: {0}")]
    Inconsistent(&'static str),

    /// File cannot hold the header and at least two major blocks
    #[error("File size {0} too small for archive")]
    FileTooSmall(u64),

    /// Buffer handed to the decoder is shorter than a header page
    #[error("Header buffer too short: {0} bytes")]
    ShortHeader(usize),

    /// Mask id beyond the configured FA entry count
    #[error("FA id too large")]
    IdTooLarge,

    /// Range whose end precedes its start
    #[error("Range of ids is empty")]
    EmptyRange,

    /// Mask text could not be understood
    #[error("{0}")]
    BadMask(&'static str),
}
