//! Value codecs
//!
//! Stores are byte-oriented; a codec turns a `CacheHolder<V>` envelope into
//! bytes and back. A payload that fails to decode is a miss, never an error
//! surfaced to the resolver, so lock sentinels and foreign payloads sharing a
//! keyspace read as absent.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::entry::CacheHolder;
use crate::error::Result;

/// Encode/decode contract between typed values and stored bytes
pub trait ValueCodec<V>: Send + Sync {
    /// Encode an envelope
    fn encode(&self, holder: &CacheHolder<V>) -> Result<Bytes>;

    /// Decode an envelope
    fn decode(&self, bytes: &[u8]) -> Result<CacheHolder<V>>;
}

/// JSON codec backed by serde_json
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl<V> ValueCodec<V> for JsonCodec
where
    V: Serialize + DeserializeOwned,
{
    fn encode(&self, holder: &CacheHolder<V>) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(holder)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<CacheHolder<V>> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// =============================================================================
// Tests
// =============================================================================
