//! Protocol Error Types

use thiserror::Error;

/// Errors reading or parsing a client command
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Command text did not match the grammar.  `offset` counts from 1.
    #[error("Error parsing {what}: {message} at offset {offset} in \"{input}\"")]
    Parse {
        what: &'static str,
        message: String,
        offset: usize,
        input: String,
    },

    #[error("Read buffer exhausted")]
    ReadBufferExhausted,

    #[error("End of file on input")]
    EndOfFile,

    #[error("Error reading command: {0}")]
    Io(#[from] std::io::Error),
}
