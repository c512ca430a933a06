//! fa-prepare: lays out a fresh archive file, or dumps an existing header

use anyhow::{bail, Context, Result};
use clap::Parser;
use fa_format::{FilterMask, PrepareParams};
use fa_storage::{load_header, prepare_archive, write_header_dump, write_index_dump};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "fa-prepare")]
#[command(about = "Prepares an FA archive file, or dumps the header of an existing one", long_about = None)]
struct Cli {
    /// Print the header of FILE instead of preparing it
    #[arg(short = 'H', long)]
    dump: bool,

    /// Print the header even if it fails validation
    #[arg(long, requires = "dump")]
    force: bool,

    /// Also print COUNT index entries from block START
    #[arg(long, num_args = 2, value_names = ["START", "COUNT"], requires = "dump")]
    index: Option<Vec<u32>>,

    /// File size, with optional K, M or G suffix.  Required for new files
    #[arg(short = 's', long, value_parser = parse_size)]
    size: Option<u64>,

    /// FA entries in each frame
    #[arg(short = 'N', long, default_value_t = PrepareParams::default().fa_entry_count)]
    fa_entry_count: u32,

    /// Bytes in each capture block
    #[arg(short = 'I', long, default_value_t = PrepareParams::default().input_block_size)]
    input_block_size: u32,

    /// FA samples per major block
    #[arg(short = 'M', long, default_value_t = PrepareParams::default().major_sample_count)]
    major_sample_count: u32,

    /// First decimation factor
    #[arg(short = 'd', long, default_value_t = PrepareParams::default().first_decimation)]
    first_decimation: u32,

    /// Second decimation factor
    #[arg(short = 'D', long, default_value_t = PrepareParams::default().second_decimation)]
    second_decimation: u32,

    /// Nominal sample frequency in Hz
    #[arg(short = 'f', long, default_value_t = PrepareParams::default().sample_frequency)]
    frequency: f64,

    /// Timestamp smoothing factor
    #[arg(short = 'T', long, default_value_t = PrepareParams::default().timestamp_iir)]
    timestamp_iir: f64,

    /// Compute and print the header without touching FILE
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// MASK FILE, or just FILE with --dump
    #[arg(required = true, num_args = 1..=2, value_names = ["MASK", "FILE"])]
    args: Vec<String>,
}

impl Cli {
    fn params(&self) -> PrepareParams {
        PrepareParams {
            input_block_size: self.input_block_size,
            major_sample_count: self.major_sample_count,
            first_decimation: self.first_decimation,
            second_decimation: self.second_decimation,
            sample_frequency: self.frequency,
            timestamp_iir: self.timestamp_iir,
            fa_entry_count: self.fa_entry_count,
        }
    }
}

/// Parses a byte count such as `4096`, `64K` or `2G`.
fn parse_size(text: &str) -> Result<u64, String> {
    let (digits, shift) = match text.chars().last() {
        Some('K' | 'k') => (&text[..text.len() - 1], 10),
        Some('M' | 'm') => (&text[..text.len() - 1], 20),
        Some('G' | 'g') => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    let value: u64 = digits.parse().map_err(|_| format!("Invalid size \"{text}\""))?;
    value
        .checked_mul(1 << shift)
        .ok_or_else(|| format!("Size \"{text}\" too large"))
}

fn dump(cli: &Cli, path: &Path, out: &mut impl Write) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("Unable to open {}", path.display()))?;
    let header = load_header(&mut file, !cli.force).context("Invalid archive header")?;
    write_header_dump(&header, out)?;
    if let Some(range) = &cli.index {
        write_index_dump(&file, &header, range[0], range[1], out)?;
    }
    Ok(())
}

fn prepare(cli: &Cli, mask: &str, path: &Path, out: &mut impl Write) -> Result<()> {
    let params = cli.params();
    let mask = FilterMask::parse(mask, params.fa_entry_count).context("Invalid FA mask")?;
    let header = prepare_archive(path, &mask, cli.size, &params, cli.dry_run)
        .with_context(|| format!("Unable to prepare {}", path.display()))?;
    write_header_dump(&header, out)?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let cli = Cli::parse();
    let mut out = std::io::stdout().lock();
    match (cli.dump, cli.args.as_slice()) {
        (true, [file]) => dump(&cli, &PathBuf::from(file), &mut out),
        (false, [mask, file]) => prepare(&cli, mask, &PathBuf::from(file), &mut out),
        (true, _) => bail!("--dump takes a single FILE"),
        (false, _) => bail!("Expected MASK FILE"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("64K"), Ok(65536));
        assert_eq!(parse_size("3m"), Ok(3 << 20));
        assert_eq!(parse_size("2G"), Ok(2 << 30));
        assert!(parse_size("G").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("99999999999G").is_err());
    }

    #[test]
    fn test_prepare_then_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive");
        let file = path.to_str().unwrap();
        let cli = Cli::parse_from([
            "fa-prepare", "-s", "1M", "-N", "16", "-I", "1024", "-M", "512", "-d", "4", "-D",
            "4", "0-3", file,
        ]);
        let mut out = Vec::new();
        prepare(&cli, &cli.args[0], &path, &mut out).unwrap();
        let prepared = String::from_utf8(out).unwrap();
        assert!(prepared.contains("4 FA ids of 16"));

        let cli = Cli::parse_from(["fa-prepare", "--dump", "--index", "0", "2", file]);
        let mut out = Vec::new();
        dump(&cli, &path, &mut out).unwrap();
        let dumped = String::from_utf8(out).unwrap();
        assert!(dumped.starts_with(&prepared));
        assert_eq!(dumped.lines().count(), prepared.lines().count() + 2);
    }

    #[test]
    fn test_dry_run_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive");
        let cli = Cli::parse_from([
            "fa-prepare", "-n", "-s", "1G", "1,5", path.to_str().unwrap(),
        ]);
        let mut out = Vec::new();
        prepare(&cli, &cli.args[0], &path, &mut out).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_bad_mask() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive");
        let cli = Cli::parse_from(["fa-prepare", "-s", "1G", "1-", path.to_str().unwrap()]);
        assert!(prepare(&cli, &cli.args[0], &path, &mut Vec::new()).is_err());
        assert!(Cli::try_parse_from(["fa-prepare", "--force", "x"]).is_err());
    }
}
