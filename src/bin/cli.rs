//! cachekeep CLI
//!
//! Offline inspection and maintenance of a cachekeep data directory.
//! Must not run against a directory a live coordinator is writing to.

use std::path::Path;
use std::process;
use std::sync::Arc;

use cachekeep::snapshot::{self, SnapshotReader};
use cachekeep::wal::{BincodeCodec, SegmentManager};
use cachekeep::{Compactor, Config, RecoveryManager};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// cachekeep CLI
#[derive(Parser, Debug)]
#[command(name = "cachekeep-cli")]
#[command(about = "Inspect, verify and compact a cachekeep data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./cachekeep_data")]
    data_dir: String,

    /// Largest WAL payload accepted while scanning, in bytes
    #[arg(long, default_value = "16777216")]
    max_entry_size: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List WAL segments and snapshots with their metadata
    Inspect,

    /// Dry-run recovery and print the result (no file is modified)
    Verify,

    /// Delete WAL segments covered by the newest verified snapshot
    Compact {
        /// Newest sealed segments to keep regardless of coverage
        #[arg(short, long, default_value = "1")]
        keep_segments: usize,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cachekeep=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .max_entry_size_bytes(args.max_entry_size)
        .build();

    let outcome = match args.command {
        Commands::Inspect => inspect(&config),
        Commands::Verify => verify(&config),
        Commands::Compact { keep_segments } => compact(&config, keep_segments),
    };

    if let Err(e) = outcome {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn inspect(config: &Config) -> cachekeep::Result<()> {
    println!("cachekeep v{} - {}", cachekeep::VERSION, config.data_dir.display());

    println!("\nWAL segments ({}):", config.wal_dir().display());
    if config.wal_dir().exists() {
        let segments = open_segments(config)?;
        for info in segments.segments() {
            let max = info
                .max_sequence
                .map_or_else(|| "-".to_string(), |s| s.to_string());
            println!("  {:>10}  {:>12} bytes  max_seq {:>10}", info.id, info.size, max);
        }
    } else {
        println!("  (none)");
    }

    println!("\nSnapshots ({}):", config.snapshot_dir().display());
    let snapshots = snapshot::list_snapshots(&config.snapshot_dir())?;
    if snapshots.is_empty() {
        println!("  (none)");
    }
    for file in snapshots.iter().rev() {
        match SnapshotReader::read_meta(&file.path) {
            Ok(meta) => println!(
                "  {}  watermark {:>10}  entries {:>10}  {:>12} bytes{}",
                file_name(&meta.path),
                meta.watermark,
                meta.entry_count,
                meta.size_bytes,
                if meta.compressed { "  zstd" } else { "" }
            ),
            Err(e) => println!("  {}  UNREADABLE: {}", file_name(&file.path), e),
        }
    }
    Ok(())
}

fn verify(config: &Config) -> cachekeep::Result<()> {
    let result = RecoveryManager::new(config.clone()).inspect()?;

    match &result.snapshot {
        Some(meta) => println!(
            "snapshot:              {} (watermark {})",
            file_name(&meta.path),
            meta.watermark
        ),
        None => println!("snapshot:              none"),
    }
    for rejected in &result.rejected_snapshots {
        println!("rejected snapshot:     {} ({})", file_name(&rejected.path), rejected.reason);
    }
    println!("loaded entries:        {}", result.loaded_entry_count);
    println!("replayed entries:      {}", result.replayed_entry_count);
    println!("last applied sequence: {}", result.last_applied_sequence);
    println!("next sequence:         {}", result.next_sequence());
    if let Some(gap) = &result.first_gap {
        println!(
            "sequence gap:          expected {}, found {} ({} missing)",
            gap.expected,
            gap.found,
            gap.missing()
        );
    }
    if let Some(point) = &result.corruption {
        println!(
            "corruption:            segment {} offset {} ({})",
            point.segment_id, point.offset, point.reason
        );
        println!(
            "corruption boundary:   {}",
            result.corruption_boundary.unwrap_or_default()
        );
    }
    for path in &result.quarantined_segments {
        println!("would quarantine:      {}", file_name(path));
    }
    println!("elapsed:               {:?}", result.elapsed);
    println!("status:                {}", if result.degraded { "DEGRADED" } else { "OK" });
    Ok(())
}

fn compact(config: &Config, keep_segments: usize) -> cachekeep::Result<()> {
    let mut candidates = snapshot::list_snapshots(&config.snapshot_dir())?;
    candidates.reverse();

    let verified = candidates
        .iter()
        .find_map(|file| match SnapshotReader::verify(&file.path) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!(path = %file.path.display(), error = %e, "Skipping snapshot");
                None
            }
        });
    let Some(meta) = verified else {
        println!("no verified snapshot; nothing to compact against");
        return Ok(());
    };

    let segments = Arc::new(open_segments(config)?);
    let report = Compactor::new(segments, keep_segments).compact(&meta);

    println!("watermark:         {}", meta.watermark);
    println!("deleted segments:  {:?}", report.deleted_segments);
    println!("reclaimed bytes:   {}", report.reclaimed_bytes);
    println!("retained segments: {}", report.retained_segments);
    Ok(())
}

fn open_segments(config: &Config) -> cachekeep::Result<SegmentManager> {
    SegmentManager::open(
        &config.wal_dir(),
        Arc::new(BincodeCodec),
        config.max_entry_size_bytes,
    )
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
