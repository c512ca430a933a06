//! Cursor over a command line
//!
//! Parsers consume the line left to right; a failure leaves the cursor at
//! the offending character so the reported offset points at it.

use crate::ProtocolError;
use chrono::{Local, NaiveDateTime, TimeZone, Utc};
use fa_format::FilterMask;

/// Failure inside a single parse step, before the command context is added
pub(crate) type Step<T> = Result<T, String>;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    pub fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    /// Consumes `ch` if it is next.
    pub fn read_char(&mut self, ch: u8) -> bool {
        if self.peek() == Some(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_char(&mut self, ch: u8) -> Step<()> {
        if self.read_char(ch) {
            Ok(())
        } else {
            Err(format!("Character '{}' expected", ch as char))
        }
    }

    pub(crate) fn expect_end(&self) -> Step<()> {
        if self.at_end() {
            Ok(())
        } else {
            Err("Unexpected character".into())
        }
    }

    fn digits(&mut self) -> Step<&'a str> {
        let rest = self.rest();
        let count = rest.bytes().take_while(u8::is_ascii_digit).count();
        if count == 0 {
            return Err("Number missing".into());
        }
        self.pos += count;
        Ok(&rest[..count])
    }

    pub(crate) fn parse_u32(&mut self) -> Step<u32> {
        let start = self.pos;
        let digits = self.digits()?;
        digits.parse().map_err(|_| {
            self.pos = start;
            "Error converting number".to_string()
        })
    }

    pub(crate) fn parse_u64(&mut self) -> Step<u64> {
        let start = self.pos;
        let digits = self.digits()?;
        digits.parse().map_err(|_| {
            self.pos = start;
            "Error converting number".to_string()
        })
    }

    fn parse_i64(&mut self) -> Step<i64> {
        let start = self.pos;
        let negative = self.read_char(b'-');
        let digits = self.digits()?;
        let value: i64 = digits.parse().map_err(|_| {
            self.pos = start;
            "Error converting number".to_string()
        })?;
        Ok(if negative { -value } else { value })
    }

    /// Optional `.` followed by up to nine digits, scaled to nanoseconds.
    fn parse_nanoseconds(&mut self) -> Step<u32> {
        if !self.read_char(b'.') {
            return Ok(0);
        }
        let start = self.pos;
        let digits = self.digits()?;
        if digits.len() > 9 {
            self.pos = start;
            return Err("Too many digits for ns".into());
        }
        let value: u32 = digits.parse().map_err(|_| "Error converting number".to_string())?;
        Ok(value * 10u32.pow(9 - digits.len() as u32))
    }

    /// `YYYY-MM-DDTHH:MM:SS[.nnn][Z]`, local time unless `Z` is given.
    fn parse_datetime(&mut self) -> Step<(i64, u32)> {
        let (naive, rest) = NaiveDateTime::parse_and_remainder(self.rest(), DATETIME_FORMAT)
            .map_err(|_| "Incomplete date time, should be yyyy-mm-ddThh:mm:ss".to_string())?;
        self.pos = self.input.len() - rest.len();
        let nsec = self.parse_nanoseconds()?;
        let seconds = if self.read_char(b'Z') {
            Utc.from_utc_datetime(&naive).timestamp()
        } else {
            Local
                .from_local_datetime(&naive)
                .earliest()
                .ok_or_else(|| "Invalid local time".to_string())?
                .timestamp()
        };
        Ok((seconds, nsec))
    }

    fn parse_seconds(&mut self) -> Step<(i64, u32)> {
        let seconds = self.parse_i64()?;
        let nsec = self.parse_nanoseconds()?;
        Ok((seconds, nsec))
    }

    /// `T` datetime or `S` seconds, returned in microseconds since the epoch.
    pub(crate) fn parse_time(&mut self) -> Step<u64> {
        let start = self.pos;
        let (seconds, nsec) = if self.read_char(b'T') {
            self.parse_datetime()?
        } else if self.read_char(b'S') {
            self.parse_seconds()?
        } else {
            return Err("Expected T or S for timestamp".into());
        };
        if seconds <= 0 {
            self.pos = start;
            return Err("Timestamp ridiculously early".into());
        }
        (seconds as u64)
            .checked_mul(1_000_000)
            .and_then(|usec| usec.checked_add(u64::from(nsec / 1000)))
            .ok_or_else(|| {
                self.pos = start;
                "Timestamp too large".to_string()
            })
    }

    pub(crate) fn parse_mask(&mut self, fa_entry_count: u32) -> Step<FilterMask> {
        let (mask, rest) =
            FilterMask::parse_prefix(self.rest(), fa_entry_count).map_err(|err| err.to_string())?;
        self.pos = self.input.len() - rest.len();
        Ok(mask)
    }

    /// Runs `parse` over `input`, wrapping any failure with its position.
    pub(crate) fn run<T>(
        what: &'static str,
        input: &'a str,
        parse: impl FnOnce(&mut Cursor<'a>) -> Step<T>,
    ) -> Result<T, ProtocolError> {
        let mut cursor = Cursor::new(input);
        parse(&mut cursor).map_err(|message| ProtocolError::Parse {
            what,
            message,
            offset: cursor.pos + 1,
            input: input.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(input: &str) -> Result<u64, ProtocolError> {
        Cursor::run("time", input, |c| {
            let t = c.parse_time()?;
            c.expect_end()?;
            Ok(t)
        })
    }

    #[test]
    fn test_seconds_with_fraction() {
        assert_eq!(time("S1300000000").unwrap(), 1_300_000_000_000_000);
        assert_eq!(time("S1300000000.5").unwrap(), 1_300_000_000_500_000);
        assert_eq!(time("S1300000000.000123999").unwrap(), 1_300_000_000_000_123);
    }

    #[test]
    fn test_utc_datetime() {
        assert_eq!(time("T2011-03-13T07:06:40Z").unwrap(), 1_300_000_000_000_000);
        assert_eq!(time("T2011-03-13T07:06:40.25Z").unwrap(), 1_300_000_000_250_000);
    }

    #[test]
    fn test_local_datetime_parses() {
        assert!(time("T2011-03-13T07:06:40").is_ok());
    }

    #[test]
    fn test_time_errors() {
        let err = time("S1.1234567890").unwrap_err().to_string();
        assert_eq!(
            err,
            "Error parsing time: Too many digits for ns at offset 4 in \"S1.1234567890\""
        );
        assert!(time("S0").unwrap_err().to_string().contains("Timestamp ridiculously early"));
        assert!(time("S-5").unwrap_err().to_string().contains("ridiculously early"));
        assert!(time("X5").unwrap_err().to_string().contains("Expected T or S"));
        assert!(time("T2011-03-13").unwrap_err().to_string().contains("Incomplete date time"));
        assert!(time("S").unwrap_err().to_string().contains("Number missing"));

        let err = time("S100000000000000").unwrap_err();
        assert!(matches!(err, ProtocolError::Parse { offset: 1, .. }));
        assert!(err.to_string().contains("Timestamp too large"));
        assert!(time("S18446744073709.551616").unwrap_err().to_string().contains("too large"));

        let err = time("S12x").unwrap_err();
        assert!(matches!(err, ProtocolError::Parse { offset: 4, .. }));
    }

    #[test]
    fn test_expect_char() {
        let result = Cursor::run("test", "AB", |c| {
            c.expect_char(b'A')?;
            c.expect_char(b'C')
        });
        assert_eq!(
            result.unwrap_err().to_string(),
            "Error parsing test: Character 'C' expected at offset 2 in \"AB\""
        );
    }
}
