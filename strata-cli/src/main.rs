//! Strata CLI
//!
//! Inspects and maintains a disk cache directory offline: statistics, single
//! value dumps, trims, consistency sweeps and progressive wipes.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use strata_cache::{CacheConfig, DiskCache, RawCodec, StorageMode, init_tracing};
use tracing::info;

#[derive(Parser)]
#[command(name = "strata-cli")]
#[command(about = "Inspect and maintain strata disk cache directories", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration to take disk settings from
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show item count, stored size, placement mode and free space
    Stats {
        /// Cache directory
        path: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write the raw bytes stored under a key to stdout
    Get {
        /// Cache directory
        path: PathBuf,

        key: String,
    },

    /// Evict items until the given limits hold
    Trim {
        /// Cache directory
        path: PathBuf,

        /// Keep at most this many items
        #[arg(long)]
        count: Option<usize>,

        /// Keep at most this many stored bytes
        #[arg(long)]
        cost: Option<u64>,

        /// Remove items written more than this many seconds ago
        #[arg(long)]
        age: Option<f64>,
    },

    /// Delete orphan blobs, stale temp files and rows whose blob is missing
    Sweep {
        /// Cache directory
        path: PathBuf,
    },

    /// Remove every item, showing progress
    Wipe {
        /// Cache directory
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(file) => CacheConfig::from_file(file)
            .with_context(|| format!("Failed to load config {}", file.display()))?,
        None => {
            let mut config = CacheConfig::default();
            config.logging.level = "warn".to_string();
            config
        }
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    // Logs go to stderr so `get` can stream values on stdout
    init_tracing(&config.logging);

    match cli.command {
        Commands::Stats { path, json } => stats(&open(&config, path)?, json),
        Commands::Get { path, key } => get(&open(&config, path)?, &key),
        Commands::Trim {
            path,
            count,
            cost,
            age,
        } => trim(&open(&config, path)?, count, cost, age),
        Commands::Sweep { path } => sweep(&open(&config, path)?),
        Commands::Wipe { path } => wipe(&open(&config, path)?),
    }
}

fn open(config: &CacheConfig, path: PathBuf) -> Result<DiskCache<Vec<u8>>> {
    if !path.join("index.db").exists() {
        bail!("{} is not a cache directory", path.display());
    }
    let mut disk = config.disk.clone();
    disk.path = path;
    // Limits apply only when asked for
    disk.auto_trim_interval_secs = 0.0;
    let cache = DiskCache::open(disk.clone(), RawCodec)
        .with_context(|| format!("Failed to open cache at {}", disk.path.display()))?;
    info!("Opened {}", disk.path.display());
    Ok(cache)
}

fn mode_label(mode: StorageMode) -> String {
    match mode {
        StorageMode::File => "file".to_string(),
        StorageMode::Inline => "inline".to_string(),
        StorageMode::Mixed { inline_threshold } => format!("mixed ({} B threshold)", inline_threshold),
    }
}

fn stats(cache: &DiskCache<Vec<u8>>, as_json: bool) -> Result<()> {
    let count = cache.total_count();
    let size = cache.total_cost();
    let free = cache.free_disk_space();

    if as_json {
        let report = json!({
            "path": cache.path(),
            "count": count,
            "size_bytes": size,
            "mode": mode_label(cache.mode()),
            "free_bytes": free,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", cache.path().display().to_string().bold().cyan());
    println!("  {:<8} {}", "items".bold(), count);
    println!("  {:<8} {} bytes", "size".bold(), size);
    println!("  {:<8} {}", "mode".bold(), mode_label(cache.mode()));
    match free {
        Some(free) => println!("  {:<8} {} bytes", "free".bold(), free),
        None => println!("  {:<8} {}", "free".bold(), "unknown".yellow()),
    }
    Ok(())
}

fn get(cache: &DiskCache<Vec<u8>>, key: &str) -> Result<()> {
    let Some(value) = cache.get(key) else {
        bail!("Key not found: {}", key);
    };
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&value)?;
    stdout.flush()?;
    Ok(())
}

fn trim(
    cache: &DiskCache<Vec<u8>>,
    count: Option<usize>,
    cost: Option<u64>,
    age: Option<f64>,
) -> Result<()> {
    if count.is_none() && cost.is_none() && age.is_none() {
        bail!("Nothing to trim: pass --count, --cost or --age");
    }

    let mut removed = 0;
    if let Some(cost) = cost {
        removed += cache.trim_to_cost(cost);
    }
    if let Some(count) = count {
        removed += cache.trim_to_count(count);
    }
    if let Some(age) = age {
        let age = Duration::try_from_secs_f64(age).context("--age must be a non-negative number")?;
        removed += cache.trim_to_age(age);
    }

    println!(
        "{} removed {} items, {} remain",
        "OK".green(),
        removed,
        cache.total_count()
    );
    Ok(())
}

fn sweep(cache: &DiskCache<Vec<u8>>) -> Result<()> {
    let report = cache.sweep();
    println!(
        "{} orphan files: {}, dangling rows: {}, temp files: {}",
        "OK".green(),
        report.orphan_files,
        report.dangling_rows,
        report.temp_files
    );
    Ok(())
}

fn wipe(cache: &DiskCache<Vec<u8>>) -> Result<()> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );
    pb.set_message("Removing items...");

    let (done_tx, done_rx) = mpsc::channel();
    let progress = pb.clone();
    cache.remove_all_with_progress(
        move |removed, total| {
            progress.set_length(total as u64);
            progress.set_position(removed as u64);
        },
        move |success| {
            let _ = done_tx.send(success);
        },
    );

    if done_rx.recv().unwrap_or(false) {
        pb.finish_with_message("Wipe complete");
        Ok(())
    } else {
        pb.abandon_with_message("Wipe failed".red().to_string());
        bail!("Wipe did not complete; rerun to remove the remaining items")
    }
}
