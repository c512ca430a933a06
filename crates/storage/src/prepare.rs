//! Archive preparation and header inspection

use crate::archive::{device_size, lock_exclusive};
use crate::StorageError;
use fa_format::{DataIndex, DiskHeader, FilterMask, PrepareParams, DISK_HEADER_SIZE};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::info;

/// Writes a fresh header and empty index to the archive at `path`.
///
/// `file_size` is required when the file does not exist yet; when given for
/// an existing file the file is resized.  With `dry_run` the header is only
/// computed and returned.
pub fn prepare_archive(
    path: &Path,
    mask: &FilterMask,
    file_size: Option<u64>,
    params: &PrepareParams,
    dry_run: bool,
) -> Result<DiskHeader, StorageError> {
    let exists = path.exists();
    let size = match (file_size, exists) {
        (Some(size), _) => size,
        (None, true) => device_size(&mut File::open(path)?)?,
        (None, false) => return Err(StorageError::SizeRequired),
    };
    let header = DiskHeader::initialise(mask, size, params)?;
    if dry_run {
        return Ok(header);
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    lock_exclusive(&file)?;
    if file_size.is_some() && file.metadata()?.is_file() {
        file.set_len(size)?;
    }
    file.write_all_at(&header.encode(), 0)?;
    let zeros = vec![0u8; header.index_data_size as usize];
    file.write_all_at(&zeros, header.index_data_start)?;
    file.sync_all()?;

    info!(
        path = %path.display(),
        size,
        blocks = header.major_block_count,
        channels = header.archive_mask_count,
        "Archive prepared"
    );
    Ok(header)
}

/// Reads the header of an archive without locking it.  `check` validates it.
pub fn load_header(file: &mut File, check: bool) -> Result<DiskHeader, StorageError> {
    let size = device_size(file)?;
    let mut page = vec![0u8; DISK_HEADER_SIZE as usize];
    file.read_exact_at(&mut page, 0)?;
    let header = DiskHeader::decode(&page)?;
    if check {
        header.validate(size)?;
    }
    Ok(header)
}

pub fn read_index_entry(
    file: &File,
    header: &DiskHeader,
    block: u32,
) -> Result<DataIndex, StorageError> {
    let mut bytes = [0u8; DataIndex::SIZE];
    file.read_exact_at(&mut bytes, header.index_offset(block))?;
    Ok(DataIndex::read_from(&bytes))
}

/// Prints every header field.
pub fn write_header_dump(header: &DiskHeader, out: &mut impl Write) -> std::io::Result<()> {
    let first = header.first_decimation();
    let second = header.second_decimation();
    writeln!(out, "FA sniffer archive: {}, v{}.",
        String::from_utf8_lossy(&header.signature).trim_end_matches('\0'), header.version)?;
    writeln!(out, "Archiving: {}", header.archive_mask)?;
    writeln!(out, "    {} FA ids of {}", header.archive_mask_count, header.fa_entry_count)?;
    writeln!(out, "Decimation {}, {} => {}, recording {} samples per block",
        first, second, first * second, header.major_sample_count)?;
    writeln!(out, "    D samples per block: {}, DD samples per block: {}",
        header.d_sample_count, header.dd_sample_count)?;
    writeln!(out, "Input block size = {} bytes, {} frames",
        header.input_block_size, header.input_frame_count())?;
    writeln!(out, "Major block size = {} bytes", header.major_block_size)?;
    writeln!(out, "Index data from {} for {} bytes",
        header.index_data_start, header.index_data_size)?;
    writeln!(out, "DD data from {} for {} bytes, {} samples",
        header.dd_data_start, header.dd_data_size, header.dd_total_count)?;
    writeln!(out, "FA+D data from {}, {} blocks, total size {}",
        header.major_data_start, header.major_block_count, header.total_data_size)?;
    writeln!(out, "Current major block: {}", header.current_major_block)?;
    writeln!(out, "Last duration: {} us, or {:.6} Hz",
        header.last_duration, header.mean_frame_rate())?;
    writeln!(out, "Timestamp IIR: {}", header.timestamp_iir)?;
    Ok(())
}

/// Prints `count` index entries from `start`, with the id_zero step between
/// consecutive entries.
pub fn write_index_dump(
    file: &File,
    header: &DiskHeader,
    start: u32,
    count: u32,
    out: &mut impl Write,
) -> Result<(), StorageError> {
    let mut last_id_zero: Option<u32> = None;
    for i in 0..count {
        let block = (start + i) % header.major_block_count;
        let entry = read_index_entry(file, header, block)?;
        let delta = last_id_zero
            .map(|last| entry.id_zero.wrapping_sub(last) as i64)
            .unwrap_or(0);
        writeln!(out, "{:6}: {:16} {:8} {:10} {:6}",
            block, entry.timestamp, entry.duration, entry.id_zero, delta)?;
        last_id_zero = Some(entry.id_zero);
    }
    Ok(())
}
