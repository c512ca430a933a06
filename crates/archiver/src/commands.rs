//! Info (`C`) and debug (`D`) command families
//!
//! Every letter after the command byte is answered in turn with one
//! response line (or several for `CI` and `CL`).  An unknown letter is
//! reported and the remaining letters are still processed.

use crate::server::{report_error, ServerContext};
use fa_protocol::{format_timestamp, PROTOCOL_VERSION};
use fa_transform::timestamp_to_index_ts;
use std::io::{self, Write};
use tracing::info;

const UNKNOWN_COMMAND: &str = "Unknown command";

/// Handles a `C` command line.
pub fn process_info(
    context: &ServerContext,
    client: &str,
    line: &str,
    out: &mut impl Write,
) -> io::Result<()> {
    let header = &context.header;
    for letter in line.chars().skip(1) {
        match letter {
            'F' => {
                let rate = context.archive.lock().header().mean_frame_rate();
                writeln!(out, "{rate:.6}")?;
            }
            'd' => writeln!(out, "{}", header.first_decimation())?,
            'D' => writeln!(out, "{}", header.second_decimation())?,
            'T' => {
                let earliest = timestamp_to_index_ts(&*context.archive.lock(), 1);
                writeln!(out, "{}", format_timestamp(earliest))?;
            }
            'U' => {
                let latest = timestamp_to_index_ts(&*context.archive.lock(), u64::MAX);
                writeln!(out, "{}", format_timestamp(latest))?;
            }
            'V' => writeln!(out, "{PROTOCOL_VERSION}")?,
            'M' => writeln!(out, "{}", header.archive_mask.format_raw(header.fa_entry_count))?,
            // No live decimated stream
            'C' => writeln!(out, "0")?,
            'K' => writeln!(out, "{}", header.fa_entry_count)?,
            'S' => match context.sniffer_status() {
                Ok(status) => writeln!(out, "{status}")?,
                Err(err) => report_error(client, out, &err)?,
            },
            'E' => match context.events_fa_id {
                Some(id) => writeln!(out, "{id}")?,
                None => writeln!(out, "-1")?,
            },
            'N' => writeln!(out, "{}", context.server_name)?,
            'I' => {
                for info in context.clients.snapshot() {
                    writeln!(out, "{info}")?;
                }
            }
            'L' => {
                for id in header.archive_mask.ids() {
                    writeln!(out, "{id}")?;
                }
            }
            _ => report_error(client, out, &UNKNOWN_COMMAND)?,
        }
    }
    out.flush()
}

/// Handles a `D` command line.  Only reachable when debug commands are on.
pub fn process_debug(
    context: &ServerContext,
    client: &str,
    line: &str,
    out: &mut impl Write,
) -> io::Result<()> {
    for letter in line.chars().skip(1) {
        match letter {
            'Q' => {
                info!(client, "Shutdown command received");
                context.request_shutdown();
                writeln!(out, "Shutdown")?;
            }
            'H' => {
                context.buffer.enable_buffer_write(false);
                writeln!(out, "Halted")?;
            }
            'R' => {
                context.buffer.enable_buffer_write(true);
                writeln!(out, "Resumed")?;
            }
            'I' => match context.interrupt_sniffer() {
                Ok(()) => writeln!(out, "Interrupted")?,
                Err(err) => report_error(client, out, &err)?,
            },
            'D' => {
                context.writer.set_enabled(false);
                writeln!(out, "Disabled")?;
            }
            'E' => {
                context.writer.set_enabled(true);
                writeln!(out, "Enabled")?;
            }
            'S' => writeln!(
                out,
                "{} {}",
                u8::from(context.buffer.buffer_write_enabled()),
                u8::from(context.writer.enabled())
            )?,
            _ => report_error(client, out, &UNKNOWN_COMMAND)?,
        }
    }
    out.flush()
}
