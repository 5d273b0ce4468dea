//! Resolver Metrics
//!
//! Counters for how resolutions were served: which tier answered, how often
//! the loader ran, and how much lock contention the stampede protocol saw.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Resolver metrics collector
#[derive(Debug)]
pub struct ResolverMetrics {
    // Per-tier hits, index = tier position
    tier_hits: Box<[AtomicU64]>,

    // Loader
    loads: AtomicU64,
    loaded_values: AtomicU64,
    load_failures: AtomicU64,
    load_latency_us: AtomicU64,

    // Locking
    locks_acquired: AtomicU64,
    lock_contention: AtomicU64,
    backoff_retries: AtomicU64,
    slow_batches: AtomicU64,
}

impl ResolverMetrics {
    /// Create a collector for `tiers` tiers
    pub fn new(tiers: usize) -> Self {
        Self {
            tier_hits: (0..tiers).map(|_| AtomicU64::new(0)).collect(),
            loads: AtomicU64::new(0),
            loaded_values: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            load_latency_us: AtomicU64::new(0),
            locks_acquired: AtomicU64::new(0),
            lock_contention: AtomicU64::new(0),
            backoff_retries: AtomicU64::new(0),
            slow_batches: AtomicU64::new(0),
        }
    }

    pub fn record_hits(&self, tier: usize, count: u64) {
        if let Some(counter) = self.tier_hits.get(tier) {
            counter.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_load(&self, values: usize, duration: Duration) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.loaded_values.fetch_add(values as u64, Ordering::Relaxed);
        self.update_latency_ema(duration);
    }

    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_locks(&self, acquired: usize, contended: usize) {
        self.locks_acquired.fetch_add(acquired as u64, Ordering::Relaxed);
        self.lock_contention.fetch_add(contended as u64, Ordering::Relaxed);
    }

    pub fn record_backoff(&self) {
        self.backoff_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_batch(&self) {
        self.slow_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn tier_hits(&self, tier: usize) -> u64 {
        self.tier_hits
            .get(tier)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn update_latency_ema(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.load_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .load_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Smoothed loader latency
    pub fn load_latency(&self) -> Duration {
        Duration::from_micros(self.load_latency_us.load(Ordering::Relaxed))
    }

    /// Fraction of resolved keys served from some tier rather than the loader
    pub fn hit_ratio(&self) -> f64 {
        let hits: u64 = self.tier_hits.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        let total = hits + self.loaded_values.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tier_hits: self.tier_hits.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
            loads: self.loads(),
            loaded_values: self.loaded_values.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            load_latency: self.load_latency(),
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            lock_contention: self.lock_contention.load(Ordering::Relaxed),
            backoff_retries: self.backoff_retries.load(Ordering::Relaxed),
            slow_batches: self.slow_batches.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in self.tier_hits.iter() {
            counter.store(0, Ordering::Relaxed);
        }
        self.loads.store(0, Ordering::Relaxed);
        self.loaded_values.store(0, Ordering::Relaxed);
        self.load_failures.store(0, Ordering::Relaxed);
        self.load_latency_us.store(0, Ordering::Relaxed);
        self.locks_acquired.store(0, Ordering::Relaxed);
        self.lock_contention.store(0, Ordering::Relaxed);
        self.backoff_retries.store(0, Ordering::Relaxed);
        self.slow_batches.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of resolver metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub tier_hits: Vec<u64>,

    // Loader
    pub loads: u64,
    pub loaded_values: u64,
    pub load_failures: u64,
    pub load_latency: Duration,

    // Locking
    pub locks_acquired: u64,
    pub lock_contention: u64,
    pub backoff_retries: u64,
    pub slow_batches: u64,

    pub hit_ratio: f64,
}

// =============================================================================
// Tests
// =============================================================================
