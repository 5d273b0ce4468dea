//! Cachelink stampede driver
//!
//! Builds the configured tier chain and fires many concurrent resolutions
//! for a small key space at it, with a synthetic slow loader. The log shows
//! how many times the loader actually ran and how the resolver's counters
//! moved.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Stampede Driver                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  N callers ──▶ TieredCache ──▶ local ──▶ redis? ──▶ slow loader │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cachelink::cache::{CachePolicy, KeyBuilder, RedisConfig, TieredCache};
use cachelink::config::{CacheConfiguration, CacheTiers};
use cachelink::error::{Error, Result};
use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cachelink - drive concurrent cache-aside resolutions against a tier chain
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis URL; only the local tier is used when unset
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Redis pool size
    #[arg(long, env = "REDIS_POOL_SIZE", default_value = "16")]
    redis_pool_size: usize,

    /// Concurrent callers per round
    #[arg(long, env = "CALLERS", default_value = "50")]
    callers: usize,

    /// Distinct keys each caller resolves
    #[arg(long, env = "KEYS", default_value = "10")]
    keys: usize,

    /// Rounds to run
    #[arg(long, env = "ROUNDS", default_value = "3")]
    rounds: usize,

    /// Resolve all keys in one batch call instead of one call per key
    #[arg(long, env = "BATCH")]
    batch: bool,

    /// Synthetic loader latency in milliseconds
    #[arg(long, env = "LOAD_DELAY_MS", default_value = "50")]
    load_delay_ms: u64,

    /// TTL of cached values in seconds
    #[arg(long, env = "EXPIRE_SECONDS", default_value = "60")]
    expire_seconds: u64,

    /// Maximum entries in the local tier
    #[arg(long, env = "LOCAL_MAX_ENTRIES", default_value = "10000")]
    local_max_entries: usize,

    /// Disable expiry jitter
    #[arg(long, env = "NO_JITTER")]
    no_jitter: bool,

    /// Remove every key after the last round
    #[arg(long, env = "INVALIDATE")]
    invalidate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn configuration(&self) -> CacheConfiguration {
        let mut config = CacheConfiguration::local_only();
        config.local.max_entries = self.local_max_entries;
        config.jitter = !self.no_jitter;
        config.redis = self.redis_url.as_ref().map(|url| RedisConfig {
            url: url.clone(),
            pool_size: self.redis_pool_size,
            ..RedisConfig::default()
        });
        config
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting cachelink stampede driver");
    info!("  Redis: {}", args.redis_url.as_deref().unwrap_or("disabled"));
    info!("  Callers per round: {}", args.callers);
    info!("  Keys: {}", args.keys);
    info!("  Rounds: {}", args.rounds);
    info!("  Mode: {}", if args.batch { "batch" } else { "single" });
    info!("  Loader delay: {}ms", args.load_delay_ms);

    let config = args.configuration();
    let tiers: CacheTiers<String> = config.build_tiers().await.map_err(|e| {
        error!("Failed to build cache tiers: {}", e);
        e
    })?;
    let cache = Arc::clone(tiers.cache());

    let policy = CachePolicy::new(Duration::from_secs(args.expire_seconds))
        .with_null_caching(Duration::from_secs(args.expire_seconds));
    let keys = KeyBuilder::new("item:");
    let params: Vec<u64> = (0..args.keys as u64).collect();
    let loads = Arc::new(AtomicUsize::new(0));

    for round in 1..=args.rounds {
        let started = Instant::now();
        let loads_before = loads.load(Ordering::SeqCst);

        let mut handles = Vec::with_capacity(args.callers);
        for _ in 0..args.callers {
            let caller = Caller {
                cache: Arc::clone(&cache),
                keys: keys.clone(),
                params: params.clone(),
                loads: Arc::clone(&loads),
                delay: Duration::from_millis(args.load_delay_ms),
                policy,
            };
            let batch = args.batch;
            handles.push(tokio::spawn(async move {
                if batch {
                    caller.run_batch().await
                } else {
                    caller.run_single().await
                }
            }));
        }

        let mut short = 0;
        for handle in handles {
            let resolved = handle
                .await
                .map_err(|e| Error::Internal(format!("caller task failed: {}", e)))??;
            if resolved != params.len() {
                short += 1;
            }
        }
        if short > 0 {
            warn!(round, callers = short, "Some callers resolved fewer values than requested");
        }

        info!(
            round,
            loader_calls = loads.load(Ordering::SeqCst) - loads_before,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Round complete"
        );
    }

    let snapshot = cache.metrics().snapshot();
    info!(
        tier_hits = ?snapshot.tier_hits,
        loads = snapshot.loads,
        loaded_values = snapshot.loaded_values,
        lock_contention = snapshot.lock_contention,
        backoff_retries = snapshot.backoff_retries,
        slow_batches = snapshot.slow_batches,
        hit_ratio = snapshot.hit_ratio,
        load_latency_us = snapshot.load_latency.as_micros() as u64,
        "Resolver metrics"
    );

    if args.invalidate {
        let all: HashSet<String> = params.iter().map(|p| keys.build(p)).collect();
        cache.remove_cache(&all).await?;
        info!(keys = all.len(), "Invalidated keys in every tier");
    }

    tiers.shutdown().await;
    info!("Driver finished");
    Ok(())
}

// =============================================================================
// Callers
// =============================================================================

struct Caller {
    cache: Arc<TieredCache<String>>,
    keys: KeyBuilder,
    params: Vec<u64>,
    loads: Arc<AtomicUsize>,
    delay: Duration,
    policy: CachePolicy,
}

impl Caller {
    async fn run_single(&self) -> Result<usize> {
        let mut resolved = 0;
        for param in &self.params {
            let value = self
                .cache
                .get_or_load_one(
                    *param,
                    |p: &u64| self.keys.build(p),
                    |p: u64| async move {
                        self.loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(self.delay).await;
                        Ok::<_, anyhow::Error>(Some(format!("value-{}", p)))
                    },
                    &self.policy,
                )
                .await?;
            if value.is_some() {
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    async fn run_batch(&self) -> Result<usize> {
        let values = self
            .cache
            .get_or_load_many(
                self.params.iter().copied(),
                |p: &u64| self.keys.build(p),
                |value: &String| parse_param(value),
                |params: Vec<u64>| async move {
                    self.loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(self.delay).await;
                    Ok::<_, anyhow::Error>(
                        params.iter().map(|p| format!("value-{}", p)).collect(),
                    )
                },
                &self.policy,
            )
            .await?;
        Ok(values.len())
    }
}

fn parse_param(value: &str) -> u64 {
    value
        .strip_prefix("value-")
        .and_then(|p| p.parse().ok())
        .unwrap_or(u64::MAX)
}

// =============================================================================
// Logging
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
    let filter = match "redis=warn".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };

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
