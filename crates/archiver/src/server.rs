//! TCP command server
//!
//! Each connection carries a single command line.  Connections are accepted
//! on the tokio runtime and then served to completion as blocking std
//! streams on the blocking pool, since reads and subscriptions spend their
//! time in file I/O and buffer waits.

use crate::clients::ClientList;
use crate::{commands, subscribe, ArchiverError};
use fa_format::DiskHeader;
use fa_protocol::read_command_line;
use fa_query::QueryEngine;
use fa_ring_buffer::BlockBuffer;
use fa_sniffer::{SnifferError, SnifferStatus, SourceControl};
use fa_storage::DiskWriter;
use fa_transform::SharedArchive;
use std::fmt;
use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a client command may touch
pub struct ServerContext {
    pub archive: SharedArchive,
    /// Header as opened; only the index fields change afterwards
    pub header: DiskHeader,
    pub writer: Arc<DiskWriter>,
    pub buffer: Arc<BlockBuffer>,
    pub query: QueryEngine,
    pub sniffer: Option<Arc<dyn SourceControl>>,
    pub clients: ClientList,
    pub server_name: String,
    pub events_fa_id: Option<u32>,
    pub debug_commands: bool,
    /// Signalled by `DQ`
    pub shutdown: Arc<Notify>,
    running: AtomicBool,
}

impl ServerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        archive: SharedArchive,
        writer: Arc<DiskWriter>,
        buffer: Arc<BlockBuffer>,
        query: QueryEngine,
        sniffer: Option<Arc<dyn SourceControl>>,
        server_name: String,
        events_fa_id: Option<u32>,
        debug_commands: bool,
    ) -> Self {
        let header = archive.lock().header().clone();
        Self {
            archive,
            header,
            writer,
            buffer,
            query,
            sniffer,
            clients: ClientList::new(),
            server_name,
            events_fa_id,
            debug_commands,
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(true),
        }
    }

    pub fn sniffer_status(&self) -> Result<SnifferStatus, SnifferError> {
        self.sniffer.as_ref().ok_or(SnifferError::NotRunning)?.status()
    }

    pub fn interrupt_sniffer(&self) -> Result<(), SnifferError> {
        info!("Interrupting sniffer");
        self.sniffer.as_ref().ok_or(SnifferError::NotRunning)?.interrupt()
    }

    /// Asks the service to shut down.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Ends long running subscriptions.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Logs an error and sends it to the client as a single line.
pub(crate) fn report_error(
    client: &str,
    out: &mut impl Write,
    err: &dyn fmt::Display,
) -> std::io::Result<()> {
    warn!(client, "Client {client} error sent: {err}");
    metrics::counter!("fa_client_errors_total").increment(1);
    writeln!(out, "{err}")?;
    out.flush()
}

/// Like [`report_error`] for when the connection is about to be dropped
/// anyway: a failed send is logged.  Returns whether the error was sent.
fn send_error(client: &str, out: &mut impl Write, err: &dyn fmt::Display) -> bool {
    match report_error(client, out, err) {
        Ok(()) => true,
        Err(e) => {
            warn!(client, error = %e, "Unable to send error to client");
            false
        }
    }
}

/// Accepts connections until the task is dropped.
pub async fn serve(context: Arc<ServerContext>, listener: TcpListener) -> Result<(), ArchiverError> {
    info!(address = %listener.local_addr()?, "Server listening");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let stream = match into_blocking(stream) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(client = %peer, error = %err, "Unable to configure connection");
                continue;
            }
        };
        let context = context.clone();
        tokio::task::spawn_blocking(move || handle_client(&context, stream, peer));
    }
}

fn into_blocking(stream: tokio::net::TcpStream) -> std::io::Result<TcpStream> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
    stream.set_write_timeout(Some(SEND_TIMEOUT))?;
    Ok(stream)
}

/// Serves the single command sent on `stream`.
pub fn handle_client(context: &ServerContext, stream: TcpStream, peer: SocketAddr) {
    let client = peer.to_string();
    let mut out = stream;
    let line = match out.try_clone().map(BufReader::new) {
        Ok(mut reader) => read_command_line(&mut reader),
        Err(err) => {
            warn!(client, error = %err, "Unable to read from client");
            return;
        }
    };
    let line = match line {
        Ok(line) => line,
        Err(err) => {
            send_error(&client, &mut out, &err);
            return;
        }
    };

    let _guard = context.clients.register(&client, &line);
    info!(client, "Client {client} command: \"{line}\"");
    metrics::counter!("fa_client_commands_total").increment(1);

    let result = dispatch(context, &client, &line, &mut out);
    match result {
        Ok(()) => debug!(client, "Client complete"),
        Err(ArchiverError::Query(err)) if err.is_request_error() => {
            warn!(client, "Client {client} error sent: {err}");
            metrics::counter!("fa_client_errors_total").increment(1);
        }
        Err(ArchiverError::Io(err)) => info!(client, error = %err, "Client connection lost"),
        Err(err) => error!(client, error = %err, "Error serving client"),
    }
}

fn dispatch(
    context: &ServerContext,
    client: &str,
    line: &str,
    out: &mut TcpStream,
) -> Result<(), ArchiverError> {
    match line.as_bytes().first() {
        Some(b'C') => Ok(commands::process_info(context, client, line, out)?),
        Some(b'R') => Ok(context.query.process_read(line, out)?),
        Some(b'S') => subscribe::process_subscribe(context, client, line, out),
        Some(b'D') if context.debug_commands => {
            Ok(commands::process_debug(context, client, line, out)?)
        }
        _ => Ok(report_error(client, out, &ArchiverError::InvalidCommand)?),
    }
}
