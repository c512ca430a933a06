//! Typed read and subscribe requests

use crate::parser::{Cursor, Step};
use crate::ProtocolError;
use fa_format::FilterMask;

/// Archive area a read is served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// Full rate FA data
    Fa,
    /// Single decimated data
    Decimated,
    /// Double decimated data
    DoubleDecimated,
}

/// Bits of the decimated field selection: min, max, mean, std
pub const ALL_DATA_FIELDS: u32 = 0xF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampMode {
    #[default]
    None,
    /// A single timestamp before the data
    Basic,
    /// A timestamp and duration before every block
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    Samples(u64),
    /// End time in microseconds since the epoch
    Time(u64),
}

/// Parsed `R` command
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    pub source: DataSource,
    /// Field selection for decimated sources
    pub data_mask: u32,
    pub mask: FilterMask,
    /// Start time in microseconds since the epoch
    pub start: u64,
    pub end: ReadEnd,
    pub send_count: bool,
    pub all_data: bool,
    pub timestamps: TimestampMode,
    pub gap_list: bool,
    pub contiguous: bool,
    pub check_id0: bool,
}

impl ReadRequest {
    /// Parses a complete `R...` command line.
    pub fn parse(line: &str, fa_entry_count: u32) -> Result<Self, ProtocolError> {
        Cursor::run("request", line, |c| {
            c.expect_char(b'R')?;
            let (source, data_mask) = parse_source(c)?;
            c.expect_char(b'M')?;
            let mask = c.parse_mask(fa_entry_count)?;
            let start = c.parse_time()?;
            let end = parse_end(c)?;
            let send_count = c.read_char(b'N');
            let all_data = c.read_char(b'A');
            let timestamps = parse_timestamp_mode(c);
            let gap_list = c.read_char(b'G');
            let contiguous = c.read_char(b'C');
            let check_id0 = c.read_char(b'Z');
            c.expect_end()?;
            Ok(Self {
                source,
                data_mask,
                mask,
                start,
                end,
                send_count,
                all_data,
                timestamps,
                gap_list,
                contiguous,
                check_id0,
            })
        })
    }
}

fn parse_source(c: &mut Cursor<'_>) -> Step<(DataSource, u32)> {
    if c.read_char(b'F') {
        return Ok((DataSource::Fa, ALL_DATA_FIELDS));
    }
    if !c.read_char(b'D') {
        return Err("Invalid source specification".into());
    }
    let source = if c.read_char(b'D') {
        DataSource::DoubleDecimated
    } else {
        DataSource::Decimated
    };
    let data_mask = if c.read_char(b'F') {
        let mask = c.parse_u32()?;
        if mask == 0 || mask > ALL_DATA_FIELDS {
            return Err(format!("Invalid decimated data fields: {mask:x}"));
        }
        mask
    } else {
        ALL_DATA_FIELDS
    };
    Ok((source, data_mask))
}

fn parse_end(c: &mut Cursor<'_>) -> Step<ReadEnd> {
    if c.read_char(b'N') {
        let samples = c.parse_u64()?;
        if samples == 0 {
            return Err("No samples requested".into());
        }
        Ok(ReadEnd::Samples(samples))
    } else if c.read_char(b'E') {
        Ok(ReadEnd::Time(c.parse_time()?))
    } else {
        Err("Expected count or end time".into())
    }
}

fn parse_timestamp_mode(c: &mut Cursor<'_>) -> TimestampMode {
    if !c.read_char(b'T') {
        TimestampMode::None
    } else if c.read_char(b'E') {
        TimestampMode::Extended
    } else {
        TimestampMode::Basic
    }
}

/// Parsed `S` command
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub mask: FilterMask,
    pub timestamps: TimestampMode,
    /// Send the id_zero of the first frame
    pub want_t0: bool,
    /// Flush every block instead of letting the socket coalesce writes
    pub uncork: bool,
    pub decimated: bool,
}

impl SubscribeRequest {
    /// Parses a complete `S...` command line.  `decimated_available` tells
    /// whether a decimated live stream exists.
    pub fn parse(
        line: &str,
        fa_entry_count: u32,
        decimated_available: bool,
    ) -> Result<Self, ProtocolError> {
        Cursor::run("subscription", line, |c| {
            c.expect_char(b'S')?;
            let mask = c.parse_mask(fa_entry_count)?;
            let timestamps = parse_timestamp_mode(c);
            let want_t0 = c.read_char(b'Z');
            let uncork = c.read_char(b'U');
            let decimated = c.read_char(b'D');
            if decimated && !decimated_available {
                return Err("Decimated data not available".into());
            }
            if decimated && timestamps == TimestampMode::Extended {
                return Err("Extended timestamps not available for decimated data".into());
            }
            c.expect_end()?;
            Ok(Self {
                mask,
                timestamps,
                want_t0,
                uncork,
                decimated,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_simple_fa_read() {
        let request = ReadRequest::parse("RFM0-3,7S1300000000N1000", 256).unwrap();
        assert_eq!(request.source, DataSource::Fa);
        assert_eq!(request.mask, FilterMask::from_ids([0, 1, 2, 3, 7]));
        assert_eq!(request.start, 1_300_000_000_000_000);
        assert_eq!(request.end, ReadEnd::Samples(1000));
        assert!(!request.send_count && !request.all_data && !request.gap_list);
        assert_eq!(request.timestamps, TimestampMode::None);
    }

    #[test]
    fn test_read_with_all_options() {
        let request =
            ReadRequest::parse("RDDF5M1S1300000000.5ES1300000010NATEGCZ", 256).unwrap();
        assert_eq!(request.source, DataSource::DoubleDecimated);
        assert_eq!(request.data_mask, 5);
        assert_eq!(request.start, 1_300_000_000_500_000);
        assert_eq!(request.end, ReadEnd::Time(1_300_000_010_000_000));
        assert!(request.send_count && request.all_data && request.gap_list);
        assert!(request.contiguous && request.check_id0);
        assert_eq!(request.timestamps, TimestampMode::Extended);

        let request = ReadRequest::parse("RDMR000FT2011-03-13T07:06:40ZN5T", 16).unwrap();
        assert_eq!(request.source, DataSource::Decimated);
        assert_eq!(request.data_mask, ALL_DATA_FIELDS);
        assert_eq!(request.mask, FilterMask::from_ids([0, 1, 2, 3]));
        assert_eq!(request.timestamps, TimestampMode::Basic);
    }

    #[test]
    fn test_read_errors() {
        let message = |line: &str| ReadRequest::parse(line, 256).unwrap_err().to_string();
        assert_eq!(
            message("RXM1S5N1"),
            "Error parsing request: Invalid source specification at offset 2 in \"RXM1S5N1\""
        );
        assert!(message("RDF16M1S5N1").contains("Invalid decimated data fields: 10"));
        assert!(message("RDF0M1S5N1").contains("Invalid decimated data fields: 0"));
        assert!(message("RFM1S5N0").contains("No samples requested"));
        assert!(message("RFM1S5X").contains("Expected count or end time"));
        assert!(message("RFM1S5N10Q").contains("Unexpected character at offset 10"));
        assert!(message("RFM300S5N1").contains("FA id too large"));
        assert!(message("RF1S5N1").contains("Character 'M' expected at offset 3"));
    }

    #[test]
    fn test_subscribe() {
        let request = SubscribeRequest::parse("S1,2TEZU", 256, false).unwrap();
        assert_eq!(request.mask, FilterMask::from_ids([1, 2]));
        assert_eq!(request.timestamps, TimestampMode::Extended);
        assert!(request.want_t0 && request.uncork && !request.decimated);

        let request = SubscribeRequest::parse("S5D", 256, true).unwrap();
        assert!(request.decimated);

        let err = SubscribeRequest::parse("S5D", 256, false).unwrap_err().to_string();
        assert_eq!(
            err,
            "Error parsing subscription: Decimated data not available at offset 4 in \"S5D\""
        );
        let err = SubscribeRequest::parse("S5TED", 256, true).unwrap_err().to_string();
        assert!(err.contains("Extended timestamps not available for decimated data"));
    }

    proptest! {
        #[test]
        fn test_sample_counts_round_trip(samples in 1u64..u64::MAX, seconds in 1i64..4_000_000_000) {
            let line = format!("RFM0S{seconds}N{samples}");
            let request = ReadRequest::parse(&line, 256).unwrap();
            prop_assert_eq!(request.end, ReadEnd::Samples(samples));
            prop_assert_eq!(request.start, seconds as u64 * 1_000_000);
        }
    }
}
