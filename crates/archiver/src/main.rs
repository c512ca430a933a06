//! FA Archiver - Main Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use fa_archiver::{init_logging, run, ArchiverConfig};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "fa-archiver")]
#[command(about = "Captures FA frames into a circular archive and serves them over TCP", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of blocks in the capture buffer
    #[arg(short = 'b', long)]
    blocks: Option<usize>,

    /// Command server port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Enable debug (D) commands
    #[arg(short = 'X', long)]
    debug_commands: bool,

    /// Only log warnings and errors
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    /// Archive file or block device
    archive: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut ArchiverConfig) {
        if let Some(blocks) = self.blocks {
            config.buffer.block_count = blocks;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.debug_commands {
            config.server.debug_commands = true;
        }
        if self.json {
            config.logging.json = true;
        }
        if let Some(archive) = self.archive {
            config.archive.path = Some(archive);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ArchiverConfig::load(cli.config.as_deref()).context("Loading configuration")?;
    let quiet = cli.quiet;
    cli.apply(&mut config);
    init_logging(&config.logging, quiet)?;

    info!("=== FA Archiver v{} ===", env!("CARGO_PKG_VERSION"));
    run(config).await.context("Archiver failed")?;
    Ok(())
}
