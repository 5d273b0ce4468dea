//! Cachelink - Multi-Tier Cache-Aside Engine
//!
//! Resolves values through an ordered chain of cache tiers, falling back to a
//! caller-supplied loader only after every tier missed, and writes the loaded
//! result back up the chain. Concurrent callers for the same key share one
//! load instead of stampeding the data source.
//!
//! # Architecture
//!
//! ```text
//! caller → TieredCache → tier 0 (local) → tier 1 (redis) → loader
//!               ↑______________ write-back ________________│
//! ```
//!
//! # Features
//!
//! - Lock-based stampede prevention over any store with put-if-absent
//! - Batched resolution with one round-trip per tier per round
//! - Bounded in-process store with a background expiry sweeper
//! - Redis store with chunked MGET and pipelined writes
//! - Failover, expiry-jitter and default-expiry decorators
//!
//! # Modules
//!
//! - [`cache`] - Stores, decorators and the tiered resolver
//! - [`config`] - Tier chain configuration and assembly
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{
    CachePolicy, FailoverStore, KeyBuilder, Loaded, LocalStore, RedisStore, SharedStore, Store,
    TieredCache,
};
pub use config::{CacheConfiguration, CacheTiers};
pub use error::{Error, Result};
