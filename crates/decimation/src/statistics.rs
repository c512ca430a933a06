//! Decimation accumulators

use fa_format::{DecimatedData, FaEntry};

/// How a channel is decimated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// X/Y position: min, max, mean and standard deviation
    Position,
    /// Event bit mask: bitwise OR
    Events,
}

/// One decimated value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decimated {
    Statistical(DecimatedData),
    EventMask(FaEntry),
}

impl Decimated {
    /// Stored form.  Event masks are repeated in all four fields.
    pub fn to_record(self) -> DecimatedData {
        match self {
            Decimated::Statistical(data) => data,
            Decimated::EventMask(value) => DecimatedData {
                min: value,
                max: value,
                mean: value,
                std: value,
            },
        }
    }
}

/// Standard deviation from a sum of squares and a sum over `2^shift` samples.
///
/// The 128 bit sum of squares holds 2^16 squares of 32 bit values without
/// loss; only the final variance is computed in floating point.  Rounding can
/// leave the variance slightly negative, which is clamped to zero.
pub fn compute_std(sum_sq: u128, sum: i64, shift: u32) -> i32 {
    let mean = sum as f64 / (1u64 << shift) as f64;
    let var = (sum_sq >> shift) as f64 - mean * mean;
    if var > 0.0 {
        var.sqrt() as i32
    } else {
        0
    }
}

/// Statistics accumulator for one position channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accumulator {
    min: FaEntry,
    max: FaEntry,
    sum_x: i64,
    sum_y: i64,
    sum_sq_x: u128,
    sum_sq_y: u128,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            min: FaEntry::new(i32::MAX, i32::MAX),
            max: FaEntry::new(i32::MIN, i32::MIN),
            sum_x: 0,
            sum_y: 0,
            sum_sq_x: 0,
            sum_sq_y: 0,
        }
    }

    #[inline]
    pub fn add(&mut self, entry: FaEntry) {
        self.min.x = self.min.x.min(entry.x);
        self.min.y = self.min.y.min(entry.y);
        self.max.x = self.max.x.max(entry.x);
        self.max.y = self.max.y.max(entry.y);
        self.sum_x += entry.x as i64;
        self.sum_y += entry.y as i64;
        self.sum_sq_x += (entry.x as i64 * entry.x as i64) as u128;
        self.sum_sq_y += (entry.y as i64 * entry.y as i64) as u128;
    }

    /// Folds a finished accumulator into this one.
    pub fn merge(&mut self, other: &Accumulator) {
        self.min.x = self.min.x.min(other.min.x);
        self.min.y = self.min.y.min(other.min.y);
        self.max.x = self.max.x.max(other.max.x);
        self.max.y = self.max.y.max(other.max.y);
        self.sum_x += other.sum_x;
        self.sum_y += other.sum_y;
        self.sum_sq_x += other.sum_sq_x;
        self.sum_sq_y += other.sum_sq_y;
    }

    /// Statistics over the `2^shift` samples accumulated so far.
    pub fn result(&self, shift: u32) -> DecimatedData {
        DecimatedData {
            min: self.min,
            max: self.max,
            mean: FaEntry::new((self.sum_x >> shift) as i32, (self.sum_y >> shift) as i32),
            std: FaEntry::new(
                compute_std(self.sum_sq_x, self.sum_x, shift),
                compute_std(self.sum_sq_y, self.sum_y, shift),
            ),
        }
    }
}

/// Bitwise OR of event masks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventAccumulator {
    bits: FaEntry,
}

impl EventAccumulator {
    #[inline]
    pub fn add(&mut self, entry: FaEntry) {
        self.bits.x |= entry.x;
        self.bits.y |= entry.y;
    }

    pub fn merge(&mut self, other: &EventAccumulator) {
        self.add(other.bits);
    }

    pub fn result(&self) -> FaEntry {
        self.bits
    }
}

/// Accumulator chosen by channel kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAccumulator {
    Statistical(Accumulator),
    Events(EventAccumulator),
}

impl ChannelAccumulator {
    pub fn new(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Position => ChannelAccumulator::Statistical(Accumulator::new()),
            ChannelKind::Events => ChannelAccumulator::Events(EventAccumulator::default()),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelAccumulator::Statistical(_) => ChannelKind::Position,
            ChannelAccumulator::Events(_) => ChannelKind::Events,
        }
    }

    #[inline]
    pub fn add(&mut self, entry: FaEntry) {
        match self {
            ChannelAccumulator::Statistical(acc) => acc.add(entry),
            ChannelAccumulator::Events(acc) => acc.add(entry),
        }
    }

    /// Merges `other` into this accumulator.  Mismatched kinds are ignored.
    pub fn merge(&mut self, other: &ChannelAccumulator) {
        match (self, other) {
            (ChannelAccumulator::Statistical(acc), ChannelAccumulator::Statistical(other)) => {
                acc.merge(other)
            }
            (ChannelAccumulator::Events(acc), ChannelAccumulator::Events(other)) => acc.merge(other),
            _ => {}
        }
    }

    pub fn result(&self, shift: u32) -> Decimated {
        match self {
            ChannelAccumulator::Statistical(acc) => Decimated::Statistical(acc.result(shift)),
            ChannelAccumulator::Events(acc) => Decimated::EventMask(acc.result()),
        }
    }

    /// Starts a fresh accumulation of the same kind.
    pub fn reset(&mut self) {
        *self = ChannelAccumulator::new(self.kind());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_statistics() {
        let mut acc = Accumulator::new();
        for (x, y) in [(2, -4), (4, -4), (4, -4), (4, -4), (5, 4), (5, 4), (7, 4), (9, 4)] {
            acc.add(FaEntry::new(x, y));
        }
        let result = acc.result(3);
        assert_eq!(result.min, FaEntry::new(2, -4));
        assert_eq!(result.max, FaEntry::new(9, 4));
        assert_eq!(result.mean, FaEntry::new(5, 0));
        assert_eq!(result.std, FaEntry::new(2, 4));
    }

    #[test]
    fn test_constant_input_has_zero_std() {
        let mut acc = Accumulator::new();
        for _ in 0..64 {
            acc.add(FaEntry::new(-123_456, i32::MAX));
        }
        let result = acc.result(6);
        assert_eq!(result.mean, FaEntry::new(-123_456, i32::MAX));
        assert_eq!(result.std, FaEntry::new(0, 0));
    }

    #[test]
    fn test_wide_sum_of_squares() {
        // 2^16 extreme samples overflow any 64 bit sum of squares
        let mut acc = Accumulator::new();
        for i in 0..(1 << 16) {
            let v = if i % 2 == 0 { i32::MAX } else { -i32::MAX };
            acc.add(FaEntry::new(v, 0));
        }
        let result = acc.result(16);
        assert_eq!(result.mean.x, 0);
        assert_eq!(result.std.x, i32::MAX);
    }

    #[test]
    fn test_events_or_together() {
        let mut first = ChannelAccumulator::new(ChannelKind::Events);
        first.add(FaEntry::new(0b0001, 0));
        first.add(FaEntry::new(0b0100, 0b10));
        let mut second = ChannelAccumulator::new(ChannelKind::Events);
        second.merge(&first);
        second.add(FaEntry::new(0b1000, 0));
        let record = second.result(4).to_record();
        assert_eq!(record.mean, FaEntry::new(0b1101, 0b10));
        assert_eq!(record.min, record.mean);
        assert_eq!(record.std, record.mean);

        second.reset();
        assert_eq!(second.result(4), Decimated::EventMask(FaEntry::default()));
    }

    #[test]
    fn test_negative_variance_clamped() {
        // sum_sq slightly too small for the mean: variance rounds below zero
        assert_eq!(compute_std(99, 40, 4), 0);
        assert_eq!(compute_std(0, 0, 4), 0);
    }

    proptest! {
        #[test]
        fn prop_merge_matches_single_pass(
            samples in proptest::collection::vec((any::<i32>(), any::<i32>()), 16)
        ) {
            let mut whole = Accumulator::new();
            let mut halves = [Accumulator::new(), Accumulator::new()];
            for (i, &(x, y)) in samples.iter().enumerate() {
                whole.add(FaEntry::new(x, y));
                halves[i / 8].add(FaEntry::new(x, y));
            }
            let mut merged = Accumulator::new();
            merged.merge(&halves[0]);
            merged.merge(&halves[1]);
            prop_assert_eq!(&merged, &whole);

            let result = whole.result(4);
            prop_assert!(result.min.x <= result.mean.x && result.mean.x <= result.max.x);
            prop_assert!(result.std.x >= 0 && result.std.y >= 0);
        }
    }
}
