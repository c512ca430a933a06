//! Channel selection mask
//!
//! Masks are written either as a list of ids and ranges (`1-3,7,9-10`) or in
//! raw form as `R` followed by one hex digit per four ids, highest id first.

use crate::FormatError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest number of FA entries in a frame
pub const MAX_FA_ENTRY_COUNT: u32 = 256;

const MASK_WORDS: usize = (MAX_FA_ENTRY_COUNT / 32) as usize;

/// Bit mask of FA ids
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterMask {
    words: [u32; MASK_WORDS],
}

impl FilterMask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a mask from raw 32 bit words, id 0 in bit 0 of word 0.
    pub fn from_words(words: [u32; MASK_WORDS]) -> Self {
        Self { words }
    }

    pub fn words(&self) -> &[u32; MASK_WORDS] {
        &self.words
    }

    pub fn from_ids(ids: impl IntoIterator<Item = u32>) -> Self {
        let mut mask = Self::new();
        for id in ids {
            mask.set(id);
        }
        mask
    }

    pub fn set(&mut self, id: u32) {
        self.words[(id >> 5) as usize] |= 1 << (id & 0x1f);
    }

    pub fn test(&self, id: u32) -> bool {
        id < MAX_FA_ENTRY_COUNT && self.words[(id >> 5) as usize] & (1 << (id & 0x1f)) != 0
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Iterates over the ids set in the mask in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        (0..MAX_FA_ENTRY_COUNT).filter(move |&id| self.test(id))
    }

    /// Returns the position of `id` among the ids set in this mask.
    pub fn position(&self, id: u32) -> Option<u32> {
        if self.test(id) {
            Some(self.ids().take_while(|&i| i < id).count() as u32)
        } else {
            None
        }
    }

    /// Parses a mask from the start of `input`, returning the unparsed tail.
    pub fn parse_prefix(input: &str, fa_entry_count: u32) -> Result<(Self, &str), FormatError> {
        match input.strip_prefix('R') {
            Some(raw) => Self::parse_raw(raw, fa_entry_count),
            None => Self::parse_list(input, fa_entry_count),
        }
    }

    /// Parses a complete mask string, rejecting trailing text.
    pub fn parse(input: &str, fa_entry_count: u32) -> Result<Self, FormatError> {
        let (mask, rest) = Self::parse_prefix(input, fa_entry_count)?;
        if rest.is_empty() {
            Ok(mask)
        } else {
            Err(FormatError::BadMask("Unexpected character"))
        }
    }

    fn parse_list(mut input: &str, fa_entry_count: u32) -> Result<(Self, &str), FormatError> {
        let mut mask = Self::new();
        loop {
            let (start, rest) = parse_id(input, fa_entry_count)?;
            let (end, rest) = match rest.strip_prefix('-') {
                Some(rest) => parse_id(rest, fa_entry_count)?,
                None => (start, rest),
            };
            if end < start {
                return Err(FormatError::EmptyRange);
            }
            for id in start..=end {
                mask.set(id);
            }
            match rest.strip_prefix(',') {
                Some(rest) => input = rest,
                None => return Ok((mask, rest)),
            }
        }
    }

    fn parse_raw(input: &str, fa_entry_count: u32) -> Result<(Self, &str), FormatError> {
        let digits = (fa_entry_count / 4) as usize;
        let hex = input
            .get(..digits)
            .ok_or(FormatError::BadMask("Raw mask too short"))?;
        let mut mask = Self::new();
        for (i, ch) in hex.chars().enumerate() {
            let nibble = ch
                .to_digit(16)
                .ok_or(FormatError::BadMask("Invalid raw mask"))?;
            let base = 4 * (digits - 1 - i) as u32;
            for bit in 0..4 {
                if nibble & (1 << bit) != 0 {
                    mask.set(base + bit);
                }
            }
        }
        Ok((mask, &input[digits..]))
    }

    /// Formats the mask in raw hex form for the first `fa_entry_count` ids.
    pub fn format_raw(&self, fa_entry_count: u32) -> String {
        (0..fa_entry_count / 4)
            .rev()
            .map(|nibble| {
                let base = nibble * 4;
                let value = (self.words[(base >> 5) as usize] >> (base & 0x1f)) & 0xf;
                char::from_digit(value, 16).map_or('0', |c| c.to_ascii_uppercase())
            })
            .collect()
    }
}

fn parse_id(input: &str, fa_entry_count: u32) -> Result<(u32, &str), FormatError> {
    let digits = input.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return Err(FormatError::BadMask("Number missing"));
    }
    let id: u32 = input[..digits]
        .parse()
        .map_err(|_| FormatError::IdTooLarge)?;
    if id >= fa_entry_count {
        return Err(FormatError::IdTooLarge);
    }
    Ok((id, &input[digits..]))
}

/// Canonical list form, for example `0-3,17`.
impl fmt::Display for FilterMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids = self.ids().peekable();
        let mut first = true;
        while let Some(start) = ids.next() {
            let mut end = start;
            while ids.peek() == Some(&(end + 1)) {
                end += 1;
                ids.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        Ok(())
    }
}
