//! FA Archiver Service
//!
//! Wires the capture thread, block buffer, transform engine and disk writer
//! together around an archive file, and serves the line based command
//! protocol over TCP: archive metadata, historical reads, live
//! subscriptions and debug controls.

pub mod app;
pub mod clients;
pub mod commands;
pub mod config;
pub mod logging;
pub mod server;
pub mod subscribe;

pub use app::{run, Archiver};
pub use clients::{ClientInfo, ClientList};
pub use config::ArchiverConfig;
pub use logging::init_logging;
pub use server::{serve, ServerContext};

use thiserror::Error;

/// Archiver errors
#[derive(Debug, Error)]
pub enum ArchiverError {
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Metrics setup failed: {0}")]
    Metrics(String),

    #[error("No archive file configured")]
    NoArchive,

    #[error("No replay file configured")]
    NoReplayFile,

    #[error(transparent)]
    Storage(#[from] fa_storage::StorageError),

    #[error(transparent)]
    Buffer(#[from] fa_ring_buffer::BufferError),

    #[error(transparent)]
    Transform(#[from] fa_transform::TransformError),

    #[error(transparent)]
    Query(#[from] fa_query::QueryError),

    #[error(transparent)]
    Protocol(#[from] fa_protocol::ProtocolError),

    #[error(transparent)]
    Sniffer(#[from] fa_sniffer::SnifferError),

    #[error("Invalid command")]
    InvalidCommand,

    #[error("No data currently available")]
    NoData,

    #[error("Gap in subscribed data")]
    SubscriptionGap,

    #[error("Write underrun to client")]
    Underrun,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
pub(crate) mod testing {
    //! Archive and service fixtures shared by the server tests

    use crate::config::{ArchiverConfig, SourceKind};
    use fa_format::{FilterMask, PrepareParams};
    use std::path::PathBuf;
    use tempfile::TempDir;

    pub const ENTRIES: u32 = 16;

    pub fn params() -> PrepareParams {
        PrepareParams {
            input_block_size: 8 * ENTRIES * 8,
            major_sample_count: 512,
            first_decimation: 4,
            second_decimation: 4,
            sample_frequency: 10000.0,
            timestamp_iir: 0.1,
            fa_entry_count: ENTRIES,
        }
    }

    /// Prepares a small archive of FA ids 0, 2 and 3.
    pub fn make_archive(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("archive");
        fa_storage::prepare_archive(
            &path,
            &FilterMask::from_ids([0, 2, 3]),
            Some(1 << 20),
            &params(),
            false,
        )
        .unwrap();
        path
    }

    pub fn config(path: PathBuf, source: SourceKind) -> ArchiverConfig {
        let mut config = ArchiverConfig::default();
        config.archive.path = Some(path);
        config.archive.direct_io = false;
        config.buffer.block_count = 16;
        config.server.name = "test archiver".into();
        config.server.debug_commands = true;
        config.server.read_pool_size = 8;
        config.capture.source = source;
        config.capture.events_fa_id = Some(3);
        config.capture.frame_interval_us = 20;
        config.capture.retry_interval_ms = 100;
        config
    }
}
