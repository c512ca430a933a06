//! Service assembly and teardown

use crate::config::{ArchiverConfig, SourceKind};
use crate::server::{serve, ServerContext};
use crate::ArchiverError;
use fa_query::QueryEngine;
use fa_ring_buffer::BlockBuffer;
use fa_sniffer::{CaptureThread, DummySource, FrameSource, ReplaySource};
use fa_storage::{open_archive, DiskWriter};
use fa_transform::{SharedArchive, TransformEngine, TransformThread};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

/// The running archiver: every thread touching the archive
pub struct Archiver {
    archive: SharedArchive,
    writer: Arc<DiskWriter>,
    context: Arc<ServerContext>,
    transform: Option<TransformThread>,
    capture: Option<CaptureThread>,
}

impl Archiver {
    /// Opens the archive and starts the transform and capture threads.
    pub fn start(config: &ArchiverConfig) -> Result<Self, ArchiverError> {
        let path = config.archive.path.as_deref().ok_or(ArchiverError::NoArchive)?;
        let (archive, writer) = open_archive(path, config.archive.direct_io)?;
        let header = archive.header().clone();
        info!(
            path = %path.display(),
            blocks = header.major_block_count,
            channels = header.archive_mask_count,
            current = header.current_major_block,
            "Archive opened"
        );
        let source = source(config, header.fa_entry_count)?;
        let archive: SharedArchive = Arc::new(Mutex::new(archive));
        let writer = Arc::new(writer);

        let buffer = Arc::new(BlockBuffer::new(
            header.input_block_size as usize,
            config.buffer.block_count,
        )?);
        let events_fa_id = config.capture.events_fa_id;
        let engine = TransformEngine::new(archive.clone(), writer.clone(), events_fa_id)?;
        let transform = TransformThread::start(engine, &buffer)?;

        let capture = match source {
            Some(source) => Some(CaptureThread::start(
                source,
                buffer.take_writer()?,
                config.capture.retry_interval(),
            )?),
            None => {
                info!("No capture source configured");
                None
            }
        };

        let query = QueryEngine::new(archive.clone(), writer.clone(), config.server.read_pool_size)?;
        let context = Arc::new(ServerContext::new(
            archive.clone(),
            writer.clone(),
            buffer,
            query,
            capture.as_ref().map(CaptureThread::control),
            config.server.name.clone(),
            events_fa_id,
            config.server.debug_commands,
        ));

        Ok(Self {
            archive,
            writer,
            context,
            transform: Some(transform),
            capture,
        })
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.context.clone()
    }

    /// Stops capture, drains the transform and writer, and flushes the
    /// archive index.
    pub fn shutdown(mut self) -> Result<(), ArchiverError> {
        self.context.stop();
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        let transform = match self.transform.take() {
            Some(transform) => transform.stop(),
            None => Ok(()),
        };
        self.writer.shutdown();
        self.archive.lock().flush()?;
        info!("Archiver stopped");
        Ok(transform?)
    }
}

fn source(
    config: &ArchiverConfig,
    fa_entry_count: u32,
) -> Result<Option<Box<dyn FrameSource>>, ArchiverError> {
    let capture = &config.capture;
    let source: Box<dyn FrameSource> = match capture.source {
        SourceKind::Dummy => Box::new(DummySource::new(
            fa_entry_count,
            capture.events_fa_id,
            capture.frame_interval(),
        )),
        SourceKind::Replay => {
            let path = capture.replay_file.as_deref().ok_or(ArchiverError::NoReplayFile)?;
            Box::new(ReplaySource::open(path, fa_entry_count, capture.frame_interval())?)
        }
        SourceKind::None => return Ok(None),
    };
    Ok(Some(source))
}

fn install_metrics(config: &ArchiverConfig) -> Result<(), ArchiverError> {
    let Some(listen) = &config.metrics.listen else {
        return Ok(());
    };
    let address: std::net::SocketAddr = listen
        .parse()
        .map_err(|_| ArchiverError::Metrics(format!("Invalid listen address \"{listen}\"")))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|err| ArchiverError::Metrics(err.to_string()))?;
    info!(%address, "Prometheus exporter listening");
    Ok(())
}

/// Waits for Ctrl-C, SIGTERM or a `DQ` command.
async fn wait_for_shutdown(context: &ServerContext) -> Result<(), ArchiverError> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted");
        }
        _ = terminate.recv() => info!("Terminated"),
        _ = context.shutdown.notified() => info!("Shutdown requested"),
    }
    Ok(())
}

/// Runs the archiver until asked to stop.
pub async fn run(config: ArchiverConfig) -> Result<(), ArchiverError> {
    install_metrics(&config)?;
    let archiver = tokio::task::block_in_place(|| Archiver::start(&config))?;
    let context = archiver.context();

    let listener = TcpListener::bind(config.server_address()).await?;
    let server = tokio::spawn(serve(context.clone(), listener));

    let waited = wait_for_shutdown(&context).await;
    server.abort();
    if let Err(err) = &waited {
        error!(error = %err, "Signal handling failed");
    }

    tokio::task::spawn_blocking(move || archiver.shutdown())
        .await
        .map_err(|err| ArchiverError::Io(std::io::Error::other(err)))??;
    waited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::time::{Duration, Instant};

    #[test]
    fn test_dummy_source_fills_archive() {
        let dir = tempfile::tempdir().unwrap();
        let config = testing::config(testing::make_archive(&dir), SourceKind::Dummy);
        let archiver = Archiver::start(&config).unwrap();
        let context = archiver.context();

        let deadline = Instant::now() + Duration::from_secs(20);
        while context.archive.lock().header().current_major_block < 2 && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(20));
        }
        let entry = context.archive.lock().index_entry(1);
        archiver.shutdown().unwrap();

        assert!(entry.duration > 0);
        assert!(entry.timestamp > 0);
    }

    #[test]
    fn test_missing_archive_path() {
        let mut config = ArchiverConfig::default();
        config.archive.direct_io = false;
        assert!(matches!(Archiver::start(&config), Err(ArchiverError::NoArchive)));
    }

    #[test]
    fn test_replay_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = testing::config(testing::make_archive(&dir), SourceKind::Replay);
        assert!(matches!(Archiver::start(&config), Err(ArchiverError::NoReplayFile)));
    }

    #[test]
    fn test_archive_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let config = testing::config(testing::make_archive(&dir), SourceKind::None);
        let archiver = Archiver::start(&config).unwrap();
        assert!(matches!(
            Archiver::start(&config),
            Err(ArchiverError::Storage(fa_storage::StorageError::Locked))
        ));
        archiver.shutdown().unwrap();
    }
}
