//! Redis Store - networked tier
//!
//! Store contract over Redis through a deadpool connection pool.
//!
//! # Design
//!
//! - Large `get_all` requests are split into MGET batches (see [`chunk_ranges`])
//! - `put_all` / `put_all_if_absent` are one pipeline of per-key writes
//! - `put_if_absent` is `SET key token NX PX ttl`, atomic on the server
//! - Payloads that fail to decode read as misses

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::batch::chunk_ranges;
use super::codec::{JsonCodec, ValueCodec};
use super::entry::{expire_at, CacheHolder, CacheResult};
use super::store::{Expiry, Store};
use crate::error::Result;

/// Typical MGET batch size once chunking kicks in
pub const MGET_BATCH_SIZE: usize = 1000;

/// Key count above which MGET is chunked
pub const MGET_CHUNK_THRESHOLD: usize = MGET_BATCH_SIZE + (MGET_BATCH_SIZE >> 1);

/// Redis connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,
    /// Maximum pooled connections
    pub pool_size: usize,
    /// Pool wait/create/recycle timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            timeout_ms: 2000,
        }
    }
}

/// Networked store backed by Redis
pub struct RedisStore<V, C = JsonCodec> {
    pool: Pool,
    codec: C,
    _marker: PhantomData<fn() -> V>,
}

impl<V> RedisStore<V, JsonCodec> {
    /// Build a pool from `config` and verify it with a PING
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        Self::connect_with_codec(config, JsonCodec).await
    }
}

impl<V, C> RedisStore<V, C> {
    /// Wrap an existing pool
    pub fn from_pool(pool: Pool, codec: C) -> Self {
        Self {
            pool,
            codec,
            _marker: PhantomData,
        }
    }

    /// Build a pool from `config` with a custom codec and verify it
    pub async fn connect_with_codec(config: &RedisConfig, codec: C) -> Result<Self> {
        info!(url = %config.url, "Connecting to Redis");

        let timeout = Duration::from_millis(config.timeout_ms);
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        redis_config.pool = Some(deadpool_redis::PoolConfig {
            max_size: config.pool_size,
            timeouts: deadpool_redis::Timeouts {
                wait: Some(timeout),
                create: Some(timeout),
                recycle: Some(timeout),
            },
            ..Default::default()
        });

        let pool = redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;

        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Connected to Redis");

        Ok(Self::from_pool(pool, codec))
    }

    async fn conn(&self) -> Result<Connection> {
        Ok(self.pool.get().await?)
    }

    fn decode(&self, key: &str, payload: Option<Vec<u8>>) -> CacheResult<V>
    where
        C: ValueCodec<V>,
    {
        let Some(payload) = payload else {
            return CacheResult::miss();
        };
        match self.codec.decode(&payload) {
            Ok(holder) => holder.into_result(),
            Err(e) => {
                warn!(key = %key, error = %e, "Redis value decode failed, treating as miss");
                CacheResult::miss()
            }
        }
    }
}

/// Milliseconds for a `PX` argument; Redis rejects zero
fn px_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn lock_token() -> String {
    format!("lock:{}", Uuid::new_v4())
}

fn set_cmd(pipe: &mut redis::Pipeline, key: &str, payload: &[u8], ttl: Expiry) {
    let cmd = pipe.cmd("SET").arg(key).arg(payload);
    if let Some(ttl) = ttl {
        cmd.arg("PX").arg(px_millis(ttl));
    }
}

fn set_nx_cmd(pipe: &mut redis::Pipeline, key: &str, token: &str, ttl: Expiry) {
    let cmd = pipe.cmd("SET").arg(key).arg(token).arg("NX");
    if let Some(ttl) = ttl {
        cmd.arg("PX").arg(px_millis(ttl));
    }
}

#[async_trait]
impl<V, C> Store<V> for RedisStore<V, C>
where
    V: Send + Sync + 'static,
    C: ValueCodec<V> + 'static,
{
    async fn get(&self, key: &str) -> Result<CacheResult<V>> {
        let mut conn = self.conn().await?;
        let payload: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(self.decode(key, payload))
    }

    async fn get_all(&self, keys: &HashSet<String>) -> Result<HashMap<String, CacheResult<V>>> {
        let keys: Vec<&String> = keys.iter().collect();
        let mut results = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(results);
        }

        let ranges = chunk_ranges(keys.len(), MGET_BATCH_SIZE, MGET_CHUNK_THRESHOLD);
        if ranges.len() > 1 {
            debug!(
                keys = keys.len(),
                batches = ranges.len(),
                "Splitting MGET into batches"
            );
        }

        let mut conn = self.conn().await?;
        for range in ranges {
            let chunk = &keys[range];
            let payloads: Vec<Option<Vec<u8>>> =
                redis::cmd("MGET").arg(chunk).query_async(&mut conn).await?;
            for (key, payload) in chunk.iter().zip(payloads) {
                results.insert((*key).clone(), self.decode(key, payload));
            }
        }

        // A short reply must not drop keys from the contract
        for key in keys {
            results
                .entry(key.clone())
                .or_insert_with(CacheResult::miss);
        }
        Ok(results)
    }

    async fn put(&self, key: &str, value: V, ttl: Expiry) -> Result<()> {
        let payload = self.codec.encode(&CacheHolder::new(value, ttl))?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(&payload[..]);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(px_millis(ttl));
        }

        let mut conn = self.conn().await?;
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn put_all(&self, values: HashMap<String, V>, ttl: Expiry) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }

        let deadline = expire_at(ttl);
        let mut pipe = redis::pipe();
        for (key, value) in values {
            let payload = self
                .codec
                .encode(&CacheHolder::with_expire_at(value, deadline))?;
            set_cmd(&mut pipe, &key, &payload, ttl);
            pipe.ignore();
        }

        let mut conn = self.conn().await?;
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, ttl: Expiry) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(lock_token()).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(px_millis(ttl));
        }

        let mut conn = self.conn().await?;
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn put_all_if_absent(&self, keys: &HashSet<String>, ttl: Expiry) -> Result<HashSet<String>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }

        let token = lock_token();
        let ordered: Vec<&String> = keys.iter().collect();
        let mut pipe = redis::pipe();
        for key in &ordered {
            set_nx_cmd(&mut pipe, key, &token, ttl);
        }

        let mut conn = self.conn().await?;
        let replies: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        Ok(ordered
            .into_iter()
            .zip(replies)
            .filter(|(_, reply)| reply.is_some())
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn remove_all(&self, keys: &HashSet<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let keys: Vec<&String> = keys.iter().collect();
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// =============================================================================
// Tests
// =============================================================================
//
// Tests marked #[ignore] need a live server at REDIS_URL.
