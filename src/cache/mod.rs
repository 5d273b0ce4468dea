//! Multi-Tier Cache-Aside Engine
//!
//! Stores, store decorators, and the tiered resolver built on them.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          TieredCache                               │
//! │        get_or_load / get_or_load_many / remove_cache               │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  Tier 0                          │  Tier 1                         │
//! │  Failover                        │  Failover                       │
//! │   └ DefaultExpiry                │   └ DefaultExpiry               │
//! │      └ Jitter                    │      └ Jitter                   │
//! │         └ LocalStore             │         └ RedisStore            │
//! │           (64-way sharded,       │           (pooled, chunked      │
//! │            swept every 1s)       │            MGET, pipelined SET) │
//! └────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                 loader
//! ```
//!
//! # Design Principles
//!
//! - Every tier is an `Arc<dyn Store<Vec<V>>>`; decorators wrap any store
//! - Absence is a miss, never an error; undecodable payloads are misses
//! - Load locks are plain TTL'd entries created with put-if-absent
//! - Tiers are an ordered list walked by index

mod batch;
mod codec;
mod entry;
mod expiry;
mod failover;
mod jitter;
mod key;
mod local;
mod lock;
mod metrics;
mod params;
mod redis;
mod shard;
mod store;
mod tiered;

pub use batch::chunk_ranges;
pub use codec::{JsonCodec, ValueCodec};
pub use entry::{now_millis, CacheHolder, CacheResult};
pub use expiry::{DefaultExpiry, DefaultExpiryStore, ExpiryUnit};
pub use failover::FailoverStore;
pub use jitter::{jittered, JitterStore};
pub use key::KeyBuilder;
pub use local::{LocalConfig, LocalStats, LocalStore, DEFAULT_SWEEP_INTERVAL, LOCAL_SHARD_COUNT};
pub use lock::{lock_key, LockGuard, LOCK_RETRY_BACKOFF, LOCK_TTL};
pub use metrics::{MetricsSnapshot, ResolverMetrics};
pub use params::{ParamCombination, ParamPack};
pub use self::redis::{RedisConfig, RedisStore, MGET_BATCH_SIZE, MGET_CHUNK_THRESHOLD};
pub use shard::ShardedMap;
pub use store::{Expiry, NoopStore, SharedStore, Store};
pub use tiered::{CachePolicy, Loaded, ResolverOptions, TieredCache};
