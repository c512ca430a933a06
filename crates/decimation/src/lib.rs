//! FA Decimation
//!
//! Reduces runs of `2^n` samples of one channel to a single record.  Position
//! channels produce min, max, mean and standard deviation; the designated
//! event channel produces the bitwise OR of its event bits instead.  Both
//! stages of archive decimation use the same accumulators: first stage
//! accumulators are merged into a per channel second stage accumulator.

mod statistics;

pub use statistics::{compute_std, Accumulator, ChannelAccumulator, ChannelKind, Decimated, EventAccumulator};

/// Accumulates `count` entries spaced `stride` bytes apart, starting at the
/// beginning of `frames`, into `acc`.
///
/// This walks one channel column of a block of interleaved frames.
pub fn decimate_strided(frames: &[u8], stride: usize, count: usize, acc: &mut ChannelAccumulator) {
    for i in 0..count {
        let at = i * stride;
        acc.add(fa_format::FaEntry::read_from(&frames[at..at + fa_format::FaEntry::SIZE]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fa_format::FaEntry;

    #[test]
    fn test_decimate_strided_column() {
        // Three channels per frame, decimate channel 1
        let mut frames = vec![0u8; 4 * 3 * FaEntry::SIZE];
        for frame in 0..4 {
            for channel in 0..3 {
                let at = (frame * 3 + channel) * FaEntry::SIZE;
                let value = (frame * 10 + channel) as i32;
                FaEntry::new(value, -value).write_to(&mut frames[at..]);
            }
        }
        let mut acc = ChannelAccumulator::new(ChannelKind::Position);
        decimate_strided(&frames[FaEntry::SIZE..], 3 * FaEntry::SIZE, 4, &mut acc);
        let Decimated::Statistical(result) = acc.result(2) else {
            panic!("position channel must decimate statistically");
        };
        assert_eq!(result.min, FaEntry::new(1, -31));
        assert_eq!(result.max, FaEntry::new(31, -1));
        assert_eq!(result.mean, FaEntry::new(16, -16));
    }
}
