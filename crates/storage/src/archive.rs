//! Locked, memory mapped archive file

use crate::StorageError;
use fa_format::{DataIndex, DecimatedData, DiskHeader, DISK_HEADER_SIZE};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// An open archive.
///
/// The header, index and DD areas are mapped into memory; the major data
/// area is accessed with positioned reads through [`Archive::data_file`].
/// The file carries an exclusive advisory lock for as long as this lives.
pub struct Archive {
    path: PathBuf,
    file: File,
    map: MmapMut,
    header: DiskHeader,
    file_size: u64,
}

pub(crate) fn lock_exclusive(file: &File) -> Result<(), StorageError> {
    // SAFETY: flock on a descriptor we own, no memory is passed
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(StorageError::Locked)
    }
}

/// Size of a file or block device.
pub(crate) fn device_size(file: &mut File) -> Result<u64, StorageError> {
    let size = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(size)
}

impl Archive {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        lock_exclusive(&file)?;
        let file_size = device_size(&mut file)?;

        let mut page = vec![0u8; DISK_HEADER_SIZE as usize];
        file.read_exact_at(&mut page, 0)?;
        let header = DiskHeader::decode(&page)?;
        header.validate(file_size)?;

        // SAFETY: the exclusive lock keeps other archivers away from the file
        let map = unsafe {
            MmapOptions::new()
                .len(header.major_data_start as usize)
                .map_mut(&file)?
        };
        info!(
            path = %path.display(),
            blocks = header.major_block_count,
            current = header.current_major_block,
            "Archive opened"
        );
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            header,
            file_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn header(&self) -> &DiskHeader {
        &self.header
    }

    /// Mutable header.  Changes reach the file on [`Archive::store_header`].
    pub fn header_mut(&mut self) -> &mut DiskHeader {
        &mut self.header
    }

    /// Copies the in-memory header into the mapped header page.
    pub fn store_header(&mut self) {
        let page = self.header.encode();
        self.map[..page.len()].copy_from_slice(&page);
    }

    fn index_range(&self, block: u32) -> std::ops::Range<usize> {
        let at = self.header.index_offset(block) as usize;
        at..at + DataIndex::SIZE
    }

    pub fn index_entry(&self, block: u32) -> DataIndex {
        DataIndex::read_from(&self.map[self.index_range(block)])
    }

    pub fn set_index_entry(&mut self, block: u32, entry: &DataIndex) {
        let range = self.index_range(block);
        entry.write_to(&mut self.map[range]);
    }

    fn dd_range(&self, channel: usize, record: u32) -> std::ops::Range<usize> {
        let at = self.header.dd_offset(channel, record) as usize;
        at..at + DecimatedData::SIZE
    }

    pub fn dd_record(&self, channel: usize, record: u32) -> DecimatedData {
        DecimatedData::read_from(&self.map[self.dd_range(channel, record)])
    }

    pub fn set_dd_record(&mut self, channel: usize, record: u32, data: &DecimatedData) {
        let range = self.dd_range(channel, record);
        data.write_to(&mut self.map[range]);
    }

    /// Raw bytes of `count` consecutive DD records of `channel` from `first`.
    /// The run must not wrap past `dd_total_count`.
    pub fn dd_bytes(&self, channel: usize, first: u32, count: u32) -> &[u8] {
        let at = self.header.dd_offset(channel, first) as usize;
        &self.map[at..at + count as usize * DecimatedData::SIZE]
    }

    /// Fills `out` with consecutive DD records of `channel` from `first`.
    pub fn read_dd_records(&self, channel: usize, first: u32, out: &mut [DecimatedData]) {
        let bytes = self.dd_bytes(channel, first, out.len() as u32);
        for (record, chunk) in out.iter_mut().zip(bytes.chunks_exact(DecimatedData::SIZE)) {
            *record = DecimatedData::read_from(chunk);
        }
    }

    /// Starts writeback of the header page and the index page holding
    /// `block` without waiting for it.
    pub fn flush_index_async(&self, block: u32) -> Result<(), StorageError> {
        self.map.flush_async_range(0, DISK_HEADER_SIZE as usize)?;
        let at = self.header.index_offset(block) as usize;
        self.map.flush_async_range(at, DataIndex::SIZE)?;
        debug!(block, "Index flush scheduled");
        Ok(())
    }

    /// Synchronously flushes every mapped area.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.map.flush()?;
        Ok(())
    }

    /// Independent handle for positioned reads of major block data.
    pub fn data_file(&self) -> Result<File, StorageError> {
        Ok(self.file.try_clone()?)
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("current", &self.header.current_major_block)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::prepare_archive;
    use fa_format::{FaEntry, FilterMask, PrepareParams};

    pub(crate) fn test_params() -> PrepareParams {
        PrepareParams {
            input_block_size: 4 * 16 * 8,
            major_sample_count: 512,
            first_decimation: 4,
            second_decimation: 4,
            sample_frequency: 10000.0,
            timestamp_iir: 0.1,
            fa_entry_count: 16,
        }
    }

    pub(crate) fn make_archive(dir: &tempfile::TempDir, blocks: u64) -> PathBuf {
        let path = dir.path().join("archive");
        let mask = FilterMask::from_ids([0, 3, 5]);
        // Each block holds 3 * 8192 data bytes plus index and DD overhead
        let size = 4 * 4096 + 4096 + blocks * 3 * 8192 + 4096;
        prepare_archive(&path, &mask, Some(size), &test_params(), false).unwrap();
        path
    }

    #[test]
    fn test_open_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_archive(&dir, 8);
        let archive = Archive::open(&path).unwrap();
        assert_eq!(archive.header().archive_mask_count, 3);
        assert!(archive.header().major_block_count >= 2);

        match Archive::open(&path) {
            Err(StorageError::Locked) => {}
            other => panic!("expected lock failure, got {other:?}"),
        }
        drop(archive);
        Archive::open(&path).unwrap();
    }

    #[test]
    fn test_index_and_dd_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_archive(&dir, 8);
        {
            let mut archive = Archive::open(&path).unwrap();
            let entry = DataIndex {
                timestamp: 1_700_000_000_000_000,
                duration: 51_200,
                id_zero: 77,
            };
            archive.set_index_entry(1, &entry);
            let record = DecimatedData {
                min: FaEntry::new(-5, -6),
                max: FaEntry::new(5, 6),
                mean: FaEntry::new(0, 1),
                std: FaEntry::new(2, 3),
            };
            archive.set_dd_record(2, 9, &record);
            archive.header_mut().current_major_block = 2;
            archive.store_header();
            archive.flush_index_async(1).unwrap();
            archive.flush().unwrap();
        }

        let archive = Archive::open(&path).unwrap();
        assert_eq!(archive.header().current_major_block, 2);
        assert_eq!(archive.index_entry(1).id_zero, 77);
        assert_eq!(archive.index_entry(0), DataIndex::default());
        let mut out = [DecimatedData::default(); 2];
        archive.read_dd_records(2, 8, &mut out);
        assert_eq!(out[0], DecimatedData::default());
        assert_eq!(out[1].max, FaEntry::new(5, 6));
    }

    #[test]
    fn test_rejects_corrupt_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_archive(&dir, 8);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(b"NOTSNIFF", 0).unwrap();
        drop(file);
        assert!(matches!(
            Archive::open(&path),
            Err(StorageError::Format(fa_format::FormatError::BadSignature))
        ));
    }
}
