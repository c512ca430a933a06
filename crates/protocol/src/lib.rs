//! FA Archiver Wire Protocol
//!
//! Every connection sends a single command line.  Read requests (`R...`)
//! and subscriptions (`S...`) are parsed here into typed requests; binary
//! response records are encoded little endian.

mod error;
mod parser;
mod records;
mod request;

pub use error::ProtocolError;
pub use records::{
    format_timestamp, ExtendedTimestamp, ExtendedTimestampHeader, GapData,
};
pub use request::{
    DataSource, ReadEnd, ReadRequest, SubscribeRequest, TimestampMode, ALL_DATA_FIELDS,
};

use std::io::{BufRead, Read};

/// Protocol version reported by the `CV` command
pub const PROTOCOL_VERSION: &str = "1.1";

/// Longest accepted command line, excluding the newline
pub const MAX_COMMAND_LENGTH: usize = 255;

/// Reads the single command line sent on a new connection.
pub fn read_command_line(input: &mut impl BufRead) -> Result<String, ProtocolError> {
    let mut line = Vec::new();
    input
        .by_ref()
        .take(MAX_COMMAND_LENGTH as u64 + 1)
        .read_until(b'\n', &mut line)?;
    match line.last() {
        Some(b'\n') => {
            line.pop();
        }
        _ if line.len() > MAX_COMMAND_LENGTH => return Err(ProtocolError::ReadBufferExhausted),
        _ => return Err(ProtocolError::EndOfFile),
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_command_line() {
        let mut input: &[u8] = b"CF\nignored";
        assert_eq!(read_command_line(&mut input).unwrap(), "CF");

        let mut input: &[u8] = b"CK\r\n";
        assert_eq!(read_command_line(&mut input).unwrap(), "CK");

        let mut input: &[u8] = b"RFM1";
        assert!(matches!(
            read_command_line(&mut input),
            Err(ProtocolError::EndOfFile)
        ));

        let long = vec![b'C'; 400];
        assert!(matches!(
            read_command_line(&mut &long[..]),
            Err(ProtocolError::ReadBufferExhausted)
        ));

        let mut exact = vec![b'C'; MAX_COMMAND_LENGTH];
        exact.push(b'\n');
        assert_eq!(read_command_line(&mut &exact[..]).unwrap().len(), MAX_COMMAND_LENGTH);
    }
}
