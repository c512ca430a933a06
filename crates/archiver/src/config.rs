//! Archiver configuration
//!
//! Loaded from an optional TOML file, then `FA_ARCHIVER_*` environment
//! variables (sections separated by `__`, e.g. `FA_ARCHIVER_SERVER__PORT`),
//! and finally overridden by command line flags in `main`.

use crate::ArchiverError;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete archiver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverConfig {
    pub archive: ArchiveConfig,
    pub buffer: BufferConfig,
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Archive file or block device, prepared with `fa-prepare`
    pub path: Option<PathBuf>,
    /// Write major blocks with O_DIRECT
    pub direct_io: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: None,
            direct_io: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Number of input blocks in the ring buffer
    pub block_count: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            block_count: fa_ring_buffer::DEFAULT_BLOCK_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Reported by the `CN` command
    pub name: String,
    /// Enables the `D` command family
    pub debug_commands: bool,
    /// Number of block buffers shared by concurrent reads
    pub read_pool_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8888,
            name: "FA Archiver".into(),
            debug_commands: false,
            read_pool_size: fa_query::DEFAULT_POOL_SIZE,
        }
    }
}

/// Where captured frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Synthetic waveforms
    Dummy,
    /// Frames looped from `capture.replay_file`
    Replay,
    /// No producer: serve the archive only
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    pub replay_file: Option<PathBuf>,
    /// FA id whose samples are event bit masks
    pub events_fa_id: Option<u32>,
    /// Interval between synthetic frames (microseconds)
    pub frame_interval_us: u64,
    /// Wait before restarting a failed source (milliseconds)
    pub retry_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Dummy,
            replay_file: None,
            events_fa_id: None,
            frame_interval_us: 100,
            retry_interval_ms: 1000,
        }
    }
}

impl CaptureConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(self.frame_interval_us)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error
    pub level: String,
    pub json: bool,
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            timestamps: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape address, e.g. `0.0.0.0:9000`
    pub listen: Option<String>,
}

impl ArchiverConfig {
    /// Loads the configuration from `path` (if given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ArchiverError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("FA_ARCHIVER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Address the command server listens on.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ArchiverConfig::default();
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.server.read_pool_size, 256);
        assert_eq!(config.buffer.block_count, 64);
        assert_eq!(config.capture.source, SourceKind::Dummy);
        assert_eq!(config.capture.frame_interval(), Duration::from_micros(100));
        assert!(config.archive.direct_io);
        assert_eq!(config.server_address(), "0.0.0.0:8888");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[archive]
path = "/data/fa-archive"
direct_io = false

[capture]
source = "replay"
replay_file = "/data/frames.bin"
events_fa_id = 255

[logging]
json = true
"#
        )
        .unwrap();

        let config = ArchiverConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.archive.path, Some(PathBuf::from("/data/fa-archive")));
        assert!(!config.archive.direct_io);
        assert_eq!(config.capture.source, SourceKind::Replay);
        assert_eq!(config.capture.events_fa_id, Some(255));
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.buffer, BufferConfig::default());
    }

    #[test]
    fn test_environment_override() {
        std::env::set_var("FA_ARCHIVER_METRICS__LISTEN", "127.0.0.1:9911");
        let config = ArchiverConfig::load(None).unwrap();
        std::env::remove_var("FA_ARCHIVER_METRICS__LISTEN");
        assert_eq!(config.metrics.listen.as_deref(), Some("127.0.0.1:9911"));
    }

    #[test]
    fn test_bad_source_kind() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[capture]\nsource = \"fpga\"").unwrap();
        assert!(matches!(
            ArchiverConfig::load(Some(file.path())),
            Err(ArchiverError::Config(_))
        ));
    }
}
