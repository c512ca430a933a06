//! FA Archive Format
//!
//! Describes the on-disk geometry of the capture archive: the fixed size
//! header at offset zero, the per major block index, the double decimated
//! data area and the major data blocks that follow.  All sizes are derived
//! from a handful of capture parameters and re-validated whenever the archive
//! is opened.

mod error;
mod header;
mod mask;
mod sample;

pub use error::FormatError;
pub use header::{DiskHeader, PrepareParams, DISK_HEADER_SIZE, DISK_SIGNATURE, DISK_VERSION};
pub use mask::{FilterMask, MAX_FA_ENTRY_COUNT};
pub use sample::{DataIndex, DecimatedData, FaEntry};

/// Page size assumed for all area alignment and direct I/O.
pub const PAGE_SIZE: u64 = 4096;

/// Rounds `value` up to the next multiple of [`PAGE_SIZE`].
pub fn page_round(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Returns true if `value` is a multiple of [`PAGE_SIZE`].
pub fn page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_round() {
        assert_eq!(page_round(0), 0);
        assert_eq!(page_round(1), 4096);
        assert_eq!(page_round(4096), 4096);
        assert_eq!(page_round(4097), 8192);
        assert!(page_aligned(8192));
        assert!(!page_aligned(8191));
    }
}
