//! Live subscriptions: masked frames straight from the block buffer

use crate::server::{report_error, ServerContext};
use crate::ArchiverError;
use fa_format::FaEntry;
use fa_protocol::{ExtendedTimestamp, ExtendedTimestampHeader, SubscribeRequest, TimestampMode};
use fa_ring_buffer::{BlockBuffer, ReadBlock, READ_TIMEOUT};
use std::io::{BufWriter, Write};
use tracing::{debug, info, warn};

const SUBSCRIBE_BUFFER_SIZE: usize = 64 * 1024;

/// What a stream needs beyond the request itself
pub struct StreamSource<'a> {
    pub buffer: &'a BlockBuffer,
    pub fa_entry_count: u32,
    pub major_sample_count: u32,
    /// Current smoothed major block duration in microseconds
    pub last_duration: &'a dyn Fn() -> u32,
    /// Polled while waiting for data; `false` ends the stream
    pub running: &'a dyn Fn() -> bool,
}

/// Handles an `S` command line.  Once the preamble is sent the stream only
/// ends on error, so the returned error is for logging.
pub fn process_subscribe(
    context: &ServerContext,
    client: &str,
    line: &str,
    out: &mut impl Write,
) -> Result<(), ArchiverError> {
    let request = match SubscribeRequest::parse(line, context.header.fa_entry_count, false) {
        Ok(request) => request,
        Err(err) => {
            report_error(client, out, &err)?;
            return Ok(());
        }
    };
    let last_duration = || context.archive.lock().header().last_duration;
    let running = || context.is_running();
    let source = StreamSource {
        buffer: &context.buffer,
        fa_entry_count: context.header.fa_entry_count,
        major_sample_count: context.header.major_sample_count,
        last_duration: &last_duration,
        running: &running,
    };
    match stream_frames(&source, &request, out) {
        Err(ArchiverError::NoData) => {
            report_error(client, out, &ArchiverError::NoData)?;
            Ok(())
        }
        Err(err @ (ArchiverError::SubscriptionGap | ArchiverError::Underrun)) => {
            warn!(client, error = %err, "Subscription ended");
            Ok(())
        }
        result => result,
    }
}

/// Streams frames until the client goes away or data is lost.
///
/// Fails with [`ArchiverError::NoData`] before anything is written if no
/// first block arrives.
pub fn stream_frames(
    source: &StreamSource<'_>,
    request: &SubscribeRequest,
    out: &mut impl Write,
) -> Result<(), ArchiverError> {
    let mut reader = source.buffer.open_reader(false);
    let frame_size = source.fa_entry_count as usize * FaEntry::SIZE;
    let block_frames = (source.buffer.block_size() / frame_size) as u32;
    let ids: Vec<usize> = request.mask.ids().map(|id| id as usize).collect();
    let mut out = BufWriter::with_capacity(SUBSCRIBE_BUFFER_SIZE, out);
    let mut started = false;

    loop {
        let (block, timestamp) = match reader.get_read_block(READ_TIMEOUT) {
            ReadBlock::Data {
                block, timestamp, ..
            } => (block, timestamp),
            ReadBlock::TimedOut if started && (source.running)() => continue,
            ReadBlock::Gap if started => return Err(ArchiverError::SubscriptionGap),
            ReadBlock::Stopped | ReadBlock::TimedOut if started => {
                debug!("Subscription stopped");
                out.flush()?;
                return Ok(());
            }
            _ => return Err(ArchiverError::NoData),
        };

        let id_zero = FaEntry::read_from(block).x as u32;
        if !started {
            out.write_all(&[0])?;
            write_header(&mut out, request, block_frames, timestamp, id_zero)?;
            started = true;
            info!(channels = ids.len(), "Subscription started");
        }
        if request.timestamps == TimestampMode::Extended {
            let duration =
                (source.last_duration)() / (source.major_sample_count / block_frames).max(1);
            ExtendedTimestamp {
                timestamp: timestamp.saturating_sub(duration as u64),
                duration,
                id_zero: request.want_t0.then_some(id_zero),
            }
            .write_to(&mut out)?;
        }
        write_masked_frames(&mut out, block, frame_size, &ids)?;
        if request.uncork {
            out.flush()?;
        }
        if !reader.release_read_block() {
            return Err(ArchiverError::Underrun);
        }
    }
}

fn write_header(
    out: &mut impl Write,
    request: &SubscribeRequest,
    block_frames: u32,
    timestamp: u64,
    id_zero: u32,
) -> std::io::Result<()> {
    match request.timestamps {
        TimestampMode::Extended => ExtendedTimestampHeader {
            block_size: block_frames,
            offset: 0,
        }
        .write_to(out),
        mode => {
            if mode == TimestampMode::Basic {
                out.write_all(&timestamp.to_le_bytes())?;
            }
            if request.want_t0 {
                out.write_all(&id_zero.to_le_bytes())?;
            }
            Ok(())
        }
    }
}

/// Copies the selected ids of every frame, in id order.
fn write_masked_frames(
    out: &mut impl Write,
    block: &[u8],
    frame_size: usize,
    ids: &[usize],
) -> std::io::Result<()> {
    for frame in block.chunks_exact(frame_size) {
        for &id in ids {
            out.write_all(&frame[id * FaEntry::SIZE..(id + 1) * FaEntry::SIZE])?;
        }
    }
    Ok(())
}
