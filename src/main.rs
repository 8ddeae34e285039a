//! Ticketstore Exerciser
//!
//! Drives a [`TicketCache`] end to end: caches a batch of payloads large
//! enough to spill to disk, pops them back through the async completion
//! queue and deferred pops, verifies every byte, then prints the cache
//! statistics.
//!
//! # Flow
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────────┐    ┌─────────┐
//! │  put N   │───▶│  wait_idle   │───▶│ pop (async + │───▶│  stats  │
//! │ payloads │    │ (spill done) │    │  deferred)   │    │ + clear │
//! └──────────┘    └──────────────┘    └──────────────┘    └─────────┘
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ticketstore::{CacheConfig, TicketCache};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Ticketstore - exercise a two-tier ticket cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML cache config; replaces the capacity, directory and worker flags
    #[arg(long, env = "TICKETSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Memory tier capacity in bytes
    #[arg(long, env = "TICKETSTORE_MEMORY_CAPACITY", default_value = "1048576")]
    memory_capacity: u64,

    /// Disk tier directory
    #[arg(long, env = "TICKETSTORE_DISK_DIR")]
    disk_dir: Option<PathBuf>,

    /// Disk tier capacity in bytes
    #[arg(long, env = "TICKETSTORE_DISK_CAPACITY", default_value = "67108864")]
    disk_capacity: u64,

    /// Worker threads for disk writes and async pops
    #[arg(long, env = "TICKETSTORE_WORKERS", default_value = "8")]
    workers: usize,

    /// Re-index ticket files left in the disk directory instead of deleting them
    #[arg(long, env = "TICKETSTORE_RECOVER")]
    recover: bool,

    /// Number of payloads to cache
    #[arg(long, default_value = "1000")]
    count: usize,

    /// Size of each payload in bytes
    #[arg(long, default_value = "4096")]
    payload_size: usize,

    /// Print the final statistics as JSON
    #[arg(long)]
    json_stats: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn cache_config(&self) -> anyhow::Result<CacheConfig> {
        if let Some(path) = &self.config {
            return CacheConfig::from_yaml_file(path)
                .with_context(|| format!("loading config from {}", path.display()));
        }

        let mut config = CacheConfig::new(
            self.memory_capacity,
            self.disk_dir
                .clone()
                .unwrap_or_else(|| CacheConfig::default().disk_directory),
            self.disk_capacity,
        );
        config.worker_threads = self.workers;
        config.recover_on_open = self.recover;
        config.validate().context("invalid cache flags")?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.cache_config()?;

    info!("Starting ticketstore exerciser");
    info!("  Memory capacity: {} bytes", config.memory_capacity_bytes);
    info!("  Disk directory: {}", config.disk_directory.display());
    info!("  Disk capacity: {} bytes", config.disk_capacity_bytes);
    info!("  Workers: {}", config.worker_threads);
    info!("  Payloads: {} x {} bytes", args.count, args.payload_size);

    let cache: TicketCache<Bytes> = TicketCache::new(config).context("creating cache")?;

    // Put phase
    let started = Instant::now();
    let mut keys = Vec::with_capacity(args.count);
    for i in 0..args.count {
        let key = cache.put(payload_for(i, args.payload_size))?;
        keys.push((i, key));
    }
    cache.wait_idle();
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        memory_bytes = cache.memory_usage(),
        disk_bytes = cache.disk_usage(),
        "Put phase complete"
    );

    // Pop phase: first half through the completion queue, rest deferred
    let started = Instant::now();
    let verified = Arc::new(AtomicUsize::new(0));
    let missing = Arc::new(AtomicUsize::new(0));
    let split = keys.len() / 2;

    for (i, key) in &keys[..split] {
        let expected = payload_for(*i, args.payload_size);
        let verified = Arc::clone(&verified);
        let missing = Arc::clone(&missing);
        cache.pop_async(key.clone(), move |ticket| match ticket {
            Some(ticket) if ticket.payload() == &expected => {
                verified.fetch_add(1, Ordering::Relaxed);
            }
            Some(ticket) => {
                warn!(key = ticket.id(), "Payload mismatch");
            }
            None => {
                missing.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    let mut delivered = 0;
    while delivered < split {
        let ran = cache.dispatch_completions_timeout(Duration::from_secs(5));
        if ran == 0 {
            bail!("timed out waiting for async pops ({}/{})", delivered, split);
        }
        delivered += ran;
    }

    for (i, key) in &keys[split..] {
        match cache.pop_deferred(key.clone()).await? {
            Some(ticket) if ticket.payload() == &payload_for(*i, args.payload_size) => {
                verified.fetch_add(1, Ordering::Relaxed);
            }
            Some(ticket) => warn!(key = ticket.id(), "Payload mismatch"),
            None => {
                missing.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    let verified = verified.load(Ordering::Relaxed);
    let missing = missing.load(Ordering::Relaxed);
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        verified,
        missing,
        "Pop phase complete"
    );

    let stats = cache.stats();
    if args.json_stats {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("puts:            {}", stats.puts);
        println!("evictions:       {}", stats.evictions);
        println!("eviction writes: {}", stats.eviction_writes);
        println!("eviction losses: {}", stats.eviction_losses);
        println!("memory pops:     {}", stats.memory_pops);
        println!("disk pops:       {}", stats.disk_pops);
        println!("pop misses:      {}", stats.pop_misses);
        println!("hit ratio:       {:.3}", stats.pop_hit_ratio);
    }

    cache.clear();
    cache.wait_idle();

    if verified + missing != args.count {
        bail!("{} payloads failed verification", args.count - verified - missing);
    }

    info!("Exerciser complete");
    Ok(())
}

/// Deterministic payload for the `i`th ticket
fn payload_for(i: usize, size: usize) -> Bytes {
    Bytes::from(vec![(i % 251) as u8; size])
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
