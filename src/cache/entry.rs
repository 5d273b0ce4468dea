//! Cache Entry Types
//!
//! The envelope written into a store (`CacheHolder`) and the per-read result
//! handed back to callers (`CacheResult`). Expiry instants are wall-clock
//! milliseconds since the Unix epoch so they survive a round-trip through a
//! remote store.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current wall-clock time in epoch milliseconds
#[inline]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Absolute expiry instant for a TTL starting now.
///
/// `None` means the entry never expires and is encoded as `0`.
#[inline]
pub fn expire_at(ttl: Option<Duration>) -> i64 {
    match ttl {
        Some(ttl) => now_millis().saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64),
        None => 0,
    }
}

/// Self-describing envelope stored in every tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHolder<V> {
    /// Cached data
    pub data: V,
    /// Expiry instant (epoch ms), `0` = never
    pub expire_at: i64,
}

impl<V> CacheHolder<V> {
    /// Wrap a value that expires after `ttl`
    pub fn new(data: V, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expire_at: expire_at(ttl),
        }
    }

    /// Wrap a value with an explicit expiry instant
    pub fn with_expire_at(data: V, expire_at: i64) -> Self {
        Self { data, expire_at }
    }

    /// Check if the envelope has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        is_expired_at(self.expire_at, now_millis())
    }

    /// Convert into a successful read result
    pub fn into_result(self) -> CacheResult<V> {
        CacheResult::hit(self.data, self.expire_at)
    }
}

/// Returns true if `expire_at` has passed at `now` (`0` never expires)
#[inline]
pub fn is_expired_at(expire_at: i64, now: i64) -> bool {
    expire_at != 0 && expire_at <= now
}

/// Outcome of a single store read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResult<V> {
    /// Whether the key was present and decodable
    pub success: bool,
    /// The cached data on success
    pub data: Option<V>,
    /// Expiry instant (epoch ms) of the entry, `0` when unknown
    pub expire_at: i64,
}

impl<V> CacheResult<V> {
    /// A successful read
    pub fn hit(data: V, expire_at: i64) -> Self {
        Self {
            success: true,
            data: Some(data),
            expire_at,
        }
    }

    /// A miss
    pub fn miss() -> Self {
        Self {
            success: false,
            data: None,
            expire_at: 0,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Take the data if the read succeeded
    pub fn into_data(self) -> Option<V> {
        if self.success {
            self.data
        } else {
            None
        }
    }
}

impl<V> Default for CacheResult<V> {
    fn default() -> Self {
        Self::miss()
    }
}

// =============================================================================
// Tests
// =============================================================================
