//! Read request processing

use crate::{BufferPool, PoolLease, QueryError};
use fa_format::{DecimatedData, DiskHeader, FaEntry, FilterMask};
use fa_protocol::{
    DataSource, ExtendedTimestamp, ExtendedTimestampHeader, GapData, ReadEnd, ReadRequest,
    TimestampMode,
};
use fa_storage::DiskWriter;
use fa_transform::{
    find_gap, timestamp_to_end, timestamp_to_start, BlockRun, IndexAccess, IndexPosition,
    SharedArchive,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Default number of channel buffers shared by all readers
pub const DEFAULT_POOL_SIZE: usize = 256;

const WRITE_BUFFER_SIZE: usize = 32 * 1024;

/// Sample geometry of one data source
#[derive(Debug, Clone, Copy)]
struct Geometry {
    source: DataSource,
    /// log2 of FA samples per source sample
    decimation_log2: u32,
    /// Source samples per major block
    block_size: u32,
}

impl Geometry {
    fn new(header: &DiskHeader, source: DataSource) -> Self {
        let (decimation_log2, block_size) = match source {
            DataSource::Fa => (0, header.major_sample_count),
            DataSource::Decimated => (header.first_decimation_log2, header.d_sample_count),
            DataSource::DoubleDecimated => (
                header.first_decimation_log2 + header.second_decimation_log2,
                header.dd_sample_count,
            ),
        };
        Self {
            source,
            decimation_log2,
            block_size,
        }
    }

    /// Blocks touched by `samples` samples starting `offset` into a block.
    fn blocks_spanned(&self, offset: u32, samples: u64) -> u32 {
        (offset as u64 + samples).div_ceil(self.block_size as u64) as u32
    }
}

/// A validated read with everything needed to send it
struct ReadPlan {
    request: ReadRequest,
    geometry: Geometry,
    /// Archive channel index of each requested id, in id order
    channels: Vec<usize>,
    block: u32,
    /// Offset of the first sample into `block`, in source samples
    offset: u32,
    samples: u64,
    first: GapData,
    gaps: Vec<GapData>,
    lease: PoolLease,
}

/// Serves read requests from the archive
pub struct QueryEngine {
    archive: SharedArchive,
    writer: Arc<DiskWriter>,
    data: File,
    header: DiskHeader,
    pool: BufferPool,
}

impl QueryEngine {
    pub fn new(
        archive: SharedArchive,
        writer: Arc<DiskWriter>,
        pool_size: usize,
    ) -> Result<Self, QueryError> {
        let (header, data) = {
            let archive = archive.lock();
            (archive.header().clone(), archive.data_file()?)
        };
        let buffer_size = header
            .fa_block_bytes()
            .max(header.d_block_bytes())
            .max(header.dd_sample_count as usize * DecimatedData::SIZE);
        Ok(Self {
            archive,
            writer,
            data,
            header,
            pool: BufferPool::new(pool_size, buffer_size),
        })
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Handles one `R` command line, writing the complete response to `out`.
    ///
    /// A request which cannot be served is answered with its error message
    /// on a single line; the error is also returned for logging.
    pub fn process_read(&self, line: &str, out: &mut impl Write) -> Result<(), QueryError> {
        let started = Instant::now();
        let plan = match self.prepare(line) {
            Ok(plan) => plan,
            Err(err) => {
                writeln!(out, "{err}")?;
                out.flush()?;
                return Err(err);
            }
        };
        let samples = plan.samples;
        self.send(plan, out)?;
        metrics::counter!("fa_read_requests_total").increment(1);
        metrics::counter!("fa_read_samples_total").increment(samples);
        debug!(samples, elapsed = ?started.elapsed(), "Read complete");
        Ok(())
    }

    fn prepare(&self, line: &str) -> Result<ReadPlan, QueryError> {
        let request = ReadRequest::parse(line, self.header.fa_entry_count)?;
        let channels = mask_to_archive(&request.mask, &self.header)?;
        let geometry = Geometry::new(&self.header, request.source);

        let (block, offset, samples, first, gaps) = {
            let archive = self.archive.lock();
            let index = &*archive;
            let (block, offset, samples) = compute_start(index, &request, &geometry)?;
            if request.contiguous {
                check_run(index, request.check_id0, &geometry, block, offset, samples)?;
            }
            let first = first_sample(index, &geometry, block, offset);
            let gaps = if request.gap_list {
                gap_list(index, request.check_id0, &geometry, block, offset, samples)
            } else {
                Vec::new()
            };
            (block, offset, samples, first, gaps)
        };

        let lease = self.pool.acquire(channels.len())?;
        debug!(
            line,
            block,
            offset,
            samples,
            channels = channels.len(),
            "Read request accepted"
        );
        Ok(ReadPlan {
            request,
            geometry,
            channels,
            block,
            offset,
            samples,
            first,
            gaps,
            lease,
        })
    }

    fn send(&self, mut plan: ReadPlan, out: &mut impl Write) -> Result<(), QueryError> {
        let mut out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, out);
        out.write_all(&[0])?;
        if plan.request.send_count {
            out.write_all(&plan.samples.to_le_bytes())?;
        }
        if plan.request.timestamps == TimestampMode::Basic {
            out.write_all(&plan.first.timestamp.to_le_bytes())?;
        }
        if plan.request.gap_list {
            out.write_all(&(plan.gaps.len() as u32 - 1).to_le_bytes())?;
            for gap in &plan.gaps {
                gap.write_to(&mut out)?;
            }
        }
        self.transfer(&mut plan, &mut out)?;
        out.flush()?;
        Ok(())
    }

    fn transfer(&self, plan: &mut ReadPlan, out: &mut impl Write) -> Result<(), QueryError> {
        let geometry = plan.geometry;
        let extended = plan.request.timestamps == TimestampMode::Extended;
        if extended {
            ExtendedTimestampHeader {
                block_size: geometry.block_size,
                offset: plan.offset,
            }
            .write_to(out)?;
        }

        let mut block = plan.block;
        let mut offset = plan.offset as usize;
        let mut remaining = plan.samples;
        while remaining > 0 {
            if extended {
                let entry = self.archive.lock().index_entry(block);
                ExtendedTimestamp {
                    timestamp: entry.timestamp,
                    duration: entry.duration,
                    id_zero: None,
                }
                .write_to(out)?;
            }

            let buffers = plan.lease.buffers_mut();
            self.read_block(geometry.source, &plan.channels, buffers, block)?;
            let count = remaining.min((geometry.block_size as usize - offset) as u64) as usize;
            write_lines(out, geometry.source, plan.request.data_mask, buffers, offset, count)?;

            remaining -= count as u64;
            offset = 0;
            block = (block + 1) % self.header.major_block_count;
        }
        Ok(())
    }

    /// Loads one block of every channel into `buffers`.
    fn read_block(
        &self,
        source: DataSource,
        channels: &[usize],
        buffers: &mut [Vec<u8>],
        block: u32,
    ) -> Result<(), QueryError> {
        let header = &self.header;
        if source == DataSource::DoubleDecimated {
            let archive = self.archive.lock();
            let first = block * header.dd_sample_count;
            for (&channel, buffer) in channels.iter().zip(buffers.iter_mut()) {
                let bytes = archive.dd_bytes(channel, first, header.dd_sample_count);
                buffer[..bytes.len()].copy_from_slice(bytes);
            }
            return Ok(());
        }

        // The block may still be on its way to disk
        self.writer.request_read()?;
        let base = header.major_block_offset(block);
        for (&channel, buffer) in channels.iter().zip(buffers.iter_mut()) {
            let (at, len) = match source {
                DataSource::Fa => (header.fa_data_offset(channel), header.fa_block_bytes()),
                _ => (header.d_data_offset(channel), header.d_block_bytes()),
            };
            self.data.read_exact_at(&mut buffer[..len], base + at as u64)?;
        }
        Ok(())
    }
}

/// Archive channel positions of every id in `mask`.
fn mask_to_archive(mask: &FilterMask, header: &DiskHeader) -> Result<Vec<usize>, QueryError> {
    mask.ids()
        .map(|id| {
            header
                .archive_mask
                .position(id)
                .map(|position| position as usize)
                .ok_or(QueryError::NotArchived(id))
        })
        .collect()
}

/// Resolves the start of a request into a block, a source sample offset and
/// the number of source samples to send.
fn compute_start(
    index: &impl IndexAccess,
    request: &ReadRequest,
    geometry: &Geometry,
) -> Result<(u32, u32, u64), QueryError> {
    let (start, available) = timestamp_to_start(index, request.start, request.all_data)?;
    let mut samples = match request.end {
        ReadEnd::Samples(samples) => samples,
        ReadEnd::Time(end) => {
            if request.start >= end {
                return Err(QueryError::RunsBackwards);
            }
            compute_end_samples(index, start, end, request.all_data, geometry.decimation_log2)?
        }
    };

    let available = available >> geometry.decimation_log2;
    if samples > available {
        if request.all_data {
            samples = available;
        } else {
            return Err(QueryError::Insufficient {
                available,
                requested: samples,
            });
        }
    }
    Ok((start.block, start.offset >> geometry.decimation_log2, samples))
}

fn compute_end_samples(
    index: &impl IndexAccess,
    start: IndexPosition,
    end: u64,
    all_data: bool,
    decimation_log2: u32,
) -> Result<u64, QueryError> {
    let end = timestamp_to_end(index, end, all_data, start.block)?;
    if end.block == start.block && end.offset < start.offset {
        return Err(QueryError::NoSamples);
    }
    let end_block = if end.block < start.block {
        end.block as u64 + index.block_count() as u64
    } else {
        end.block as u64
    };
    let fa_samples = index.major_sample_count() as u64 * (end_block - start.block as u64)
        + end.offset as u64
        - start.offset as u64;
    match fa_samples >> decimation_log2 {
        0 => Err(QueryError::NoSamples),
        samples => Ok(samples),
    }
}

/// Fails unless the blocks holding the requested samples follow on from
/// each other without a gap.
fn check_run(
    index: &impl IndexAccess,
    check_id0: bool,
    geometry: &Geometry,
    block: u32,
    offset: u32,
    samples: u64,
) -> Result<(), QueryError> {
    let blocks = geometry.blocks_spanned(offset, samples);
    let mut run = BlockRun {
        block,
        remaining: blocks,
    };
    if find_gap(index, check_id0, &mut run) {
        let contiguous = (blocks - run.remaining) as u64 * geometry.block_size as u64;
        Err(QueryError::NotContiguous(contiguous - offset as u64))
    } else {
        Ok(())
    }
}

/// Timestamp and id_zero of the first sample sent.
fn first_sample(index: &impl IndexAccess, geometry: &Geometry, block: u32, offset: u32) -> GapData {
    let entry = index.entry(block);
    GapData {
        data_index: 0,
        id_zero: entry.id_zero.wrapping_add(offset << geometry.decimation_log2),
        timestamp: entry.timestamp
            + offset as u64 * entry.duration as u64 / geometry.block_size as u64,
    }
}

/// The first sample followed by the start of every block after a gap.
fn gap_list(
    index: &impl IndexAccess,
    check_id0: bool,
    geometry: &Geometry,
    block: u32,
    offset: u32,
    samples: u64,
) -> Vec<GapData> {
    let n = index.block_count();
    let mut gaps = vec![first_sample(index, geometry, block, offset)];
    let mut run = BlockRun {
        block,
        remaining: geometry.blocks_spanned(offset, samples),
    };
    while find_gap(index, check_id0, &mut run) {
        let entry = index.entry(run.block);
        let blocks_since_start = (run.block + n - block) % n;
        gaps.push(GapData {
            data_index: blocks_since_start * geometry.block_size - offset,
            id_zero: entry.id_zero,
            timestamp: entry.timestamp,
        });
    }
    gaps
}

/// Writes `count` lines from sample `first` of each channel buffer.
fn write_lines(
    out: &mut impl Write,
    source: DataSource,
    data_mask: u32,
    buffers: &[Vec<u8>],
    first: usize,
    count: usize,
) -> std::io::Result<()> {
    for sample in first..first + count {
        for buffer in buffers {
            if source == DataSource::Fa {
                let at = sample * FaEntry::SIZE;
                out.write_all(&buffer[at..at + FaEntry::SIZE])?;
            } else {
                let at = sample * DecimatedData::SIZE;
                let record = &buffer[at..at + DecimatedData::SIZE];
                for (field, value) in record.chunks_exact(FaEntry::SIZE).enumerate() {
                    if data_mask & (1 << field) != 0 {
                        out.write_all(value)?;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fa_format::{DataIndex, PrepareParams};
    use fa_storage::{prepare_archive, Archive};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    const T0: u64 = 1_300_000_000_000_000;
    const DURATION: u32 = 51_200;
    const SAMPLES: u32 = 512;
    const GAP_BLOCK: u32 = 6;
    const CURRENT: u32 = 10;
    const IDS: [u32; 3] = [0, 3, 5];

    fn block_timestamp(block: u32) -> u64 {
        let skew = if block >= GAP_BLOCK { 50_000 } else { 0 };
        T0 + block as u64 * DURATION as u64 + skew
    }

    fn block_id_zero(block: u32) -> u32 {
        block * SAMPLES + if block >= GAP_BLOCK { 500 } else { 0 }
    }

    struct Fixture {
        engine: QueryEngine,
        _writer: Arc<DiskWriter>,
        _dir: TempDir,
    }

    /// Sixteen block archive of ids 0, 3 and 5 with blocks 0..10 written
    /// and a 50ms gap before block 6.  FA x values count samples from the
    /// start of the archive, y holds the id.
    fn fixture(pool_size: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive");
        let params = PrepareParams {
            input_block_size: 4 * 16 * 8,
            major_sample_count: SAMPLES,
            first_decimation: 4,
            second_decimation: 4,
            sample_frequency: 10000.0,
            timestamp_iir: 0.1,
            fa_entry_count: 16,
        };
        let mask = FilterMask::from_ids(IDS);
        prepare_archive(&path, &mask, Some(450_560), &params, false).unwrap();

        let mut archive = Archive::open(&path).unwrap();
        let header = archive.header().clone();
        assert_eq!(header.major_block_count, 16);
        let file = archive.data_file().unwrap();
        for block in 0..CURRENT {
            let mut data = vec![0u8; header.major_block_size as usize];
            for (channel, &id) in IDS.iter().enumerate() {
                let id = id as i32;
                for s in 0..SAMPLES as usize {
                    let at = header.fa_data_offset(channel) + s * FaEntry::SIZE;
                    FaEntry::new((block * SAMPLES) as i32 + s as i32, id).write_to(&mut data[at..]);
                }
                for k in 0..header.d_sample_count {
                    let g = (block * header.d_sample_count + k) as i32;
                    let at = header.d_data_offset(channel) + k as usize * DecimatedData::SIZE;
                    DecimatedData {
                        min: FaEntry::new(g, id),
                        max: FaEntry::new(g + 1_000_000, id),
                        mean: FaEntry::new(g + 2_000_000, id),
                        std: FaEntry::new(g + 3_000_000, id),
                    }
                    .write_to(&mut data[at..]);
                }
                for k in 0..header.dd_sample_count {
                    let record = block * header.dd_sample_count + k;
                    let dd = DecimatedData {
                        min: FaEntry::new(record as i32, id),
                        ..Default::default()
                    };
                    archive.set_dd_record(channel, record, &dd);
                }
            }
            file.write_all_at(&data, header.major_block_offset(block)).unwrap();
            let entry = DataIndex {
                timestamp: block_timestamp(block),
                duration: DURATION,
                id_zero: block_id_zero(block),
            };
            archive.set_index_entry(block, &entry);
        }
        archive.header_mut().current_major_block = CURRENT;
        archive.store_header();

        let writer = Arc::new(DiskWriter::start(&path, false).unwrap());
        let archive = Arc::new(Mutex::new(archive));
        let engine = QueryEngine::new(archive, writer.clone(), pool_size).unwrap();
        Fixture {
            engine,
            _writer: writer,
            _dir: dir,
        }
    }

    fn read(engine: &QueryEngine, line: &str) -> Vec<u8> {
        let mut out = Vec::new();
        engine.process_read(line, &mut out).unwrap();
        assert_eq!(out[0], 0);
        out
    }

    fn read_error(engine: &QueryEngine, line: &str) -> String {
        let mut out = Vec::new();
        let err = engine.process_read(line, &mut out).unwrap_err();
        assert_eq!(String::from_utf8(out).unwrap(), format!("{err}\n"));
        err.to_string()
    }

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn u64_at(bytes: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    fn entry_at(bytes: &[u8], at: usize) -> FaEntry {
        FaEntry::read_from(&bytes[at..])
    }

    // 1300000000.1124 is 10ms into block 2, FA sample 100 of that block
    const START: &str = "S1300000000.1124";

    #[test]
    fn test_fa_read_with_headers() {
        let fixture = fixture(16);
        let out = read(&fixture.engine, &format!("RFM3,5{START}N500NTG"));
        assert_eq!(u64_at(&out, 1), 500);
        assert_eq!(u64_at(&out, 9), T0 + 112_400);
        assert_eq!(u32_at(&out, 17), 0);
        assert_eq!(u32_at(&out, 21), 0);
        assert_eq!(u32_at(&out, 25), 2 * SAMPLES + 100);
        assert_eq!(u64_at(&out, 29), T0 + 112_400);

        let data = &out[37..];
        assert_eq!(data.len(), 500 * 16);
        for line in [0usize, 411, 412, 499] {
            let sample = 1124 + line as i32;
            assert_eq!(entry_at(data, line * 16), FaEntry::new(sample, 3));
            assert_eq!(entry_at(data, line * 16 + 8), FaEntry::new(sample, 5));
        }
        assert_eq!(fixture.engine.pool().available(), 16);
    }

    #[test]
    fn test_gap_list_reports_gap() {
        let fixture = fixture(16);
        let out = read(&fixture.engine, &format!("RFM3{START}N2000G"));
        assert_eq!(u32_at(&out, 1), 1);
        // Entry 0 then the start of block 6
        assert_eq!(u32_at(&out, 5), 0);
        assert_eq!(u32_at(&out, 21), 4 * SAMPLES - 100);
        assert_eq!(u32_at(&out, 25), block_id_zero(GAP_BLOCK));
        assert_eq!(u64_at(&out, 29), block_timestamp(GAP_BLOCK));
        assert_eq!(out.len(), 37 + 2000 * 8);
    }

    #[test]
    fn test_contiguous_read_stops_at_gap() {
        let fixture = fixture(16);
        assert_eq!(
            read_error(&fixture.engine, &format!("RFM3{START}N2000C")),
            "Only 1948 contiguous samples available"
        );
        read(&fixture.engine, &format!("RFM3{START}N1948C"));
    }

    #[test]
    fn test_id_zero_checked_only_on_request() {
        let fixture = fixture(16);
        // Blocks 0 and 1 follow on in both time and id_zero
        read(&fixture.engine, "RFM0S1300000000N1024CZ");
    }

    #[test]
    fn test_availability() {
        let fixture = fixture(16);
        assert_eq!(
            read_error(&fixture.engine, &format!("RFM3{START}N5000")),
            "Only 3996 samples of 5000 requested available"
        );
        let out = read(&fixture.engine, &format!("RFM3{START}N5000NA"));
        assert_eq!(u64_at(&out, 1), 3996);
        assert_eq!(out.len(), 9 + 3996 * 8);
    }

    #[test]
    fn test_end_time() {
        let fixture = fixture(16);
        let out = read(&fixture.engine, &format!("RFM0{START}ES1300000000.2148N"));
        assert_eq!(u64_at(&out, 1), 1024);
        assert_eq!(out.len(), 9 + 1024 * 8);

        assert_eq!(
            read_error(&fixture.engine, "RFM0S1300000000.2ES1300000000.1"),
            "Time range runs backwards"
        );
        assert_eq!(
            read_error(&fixture.engine, &format!("RFM0{START}ES1300000000.112401")),
            "No samples in selected range"
        );
    }

    #[test]
    fn test_request_errors() {
        let fixture = fixture(16);
        let engine = &fixture.engine;
        assert_eq!(read_error(engine, "RFM4S1300000000N10"), "BPM 4 not in archive");
        assert_eq!(read_error(engine, "RFM0S1200000000N10"), "Start time too early");
        assert_eq!(read_error(engine, "RFM0S1400000000N10"), "Start time too late");
        assert!(read_error(engine, "RQM0S1300000000N10").starts_with("Error parsing request"));
    }

    #[test]
    fn test_decimated_fields() {
        let fixture = fixture(16);
        let out = read(&fixture.engine, &format!("RDF5M5{START}N10"));
        let data = &out[1..];
        assert_eq!(data.len(), 10 * 16);
        // D sample 25 of block 2, min then mean
        assert_eq!(entry_at(data, 0), FaEntry::new(281, 5));
        assert_eq!(entry_at(data, 8), FaEntry::new(2_000_281, 5));
        assert_eq!(entry_at(data, 9 * 16), FaEntry::new(290, 5));
    }

    #[test]
    fn test_double_decimated_read() {
        let fixture = fixture(16);
        let out = read(&fixture.engine, &format!("RDDM0{START}N4T"));
        // Offset 100 becomes DD sample 6 of 32, 1.6ms per sample
        assert_eq!(u64_at(&out, 1), T0 + 102_400 + 9_600);
        let data = &out[9..];
        assert_eq!(data.len(), 4 * DecimatedData::SIZE);
        for line in 0..4 {
            let record = DecimatedData::read_from(&data[line * DecimatedData::SIZE..]);
            assert_eq!(record.min, FaEntry::new(70 + line as i32, 0));
        }
    }

    #[test]
    fn test_extended_timestamps() {
        let fixture = fixture(16);
        let out = read(&fixture.engine, &format!("RFM0{START}N500TE"));
        assert_eq!(u32_at(&out, 1), SAMPLES);
        assert_eq!(u32_at(&out, 5), 100);
        assert_eq!(u64_at(&out, 9), block_timestamp(2));
        assert_eq!(u32_at(&out, 17), DURATION);
        let second = 21 + 412 * 8;
        assert_eq!(entry_at(&out, second - 8), FaEntry::new(3 * SAMPLES as i32 - 1, 0));
        assert_eq!(u64_at(&out, second), block_timestamp(3));
        assert_eq!(entry_at(&out, second + 12), FaEntry::new(3 * SAMPLES as i32, 0));
        assert_eq!(out.len(), second + 12 + 88 * 8);
    }

    #[test]
    fn test_pool_exhaustion() {
        let fixture = fixture(2);
        assert_eq!(
            read_error(&fixture.engine, "RFM0,3,5S1300000000N1"),
            "Read too busy"
        );
        read(&fixture.engine, "RFM0,3S1300000000N1");
        assert_eq!(fixture.engine.pool().available(), 2);
    }
}
