//! Cache key building
//!
//! Keys are `prefix + json(param)`. The prefix names the cached domain, the
//! JSON suffix makes equal parameters produce equal keys.

use std::fmt::Debug;

use serde::Serialize;
use tracing::warn;

use crate::error::Result;

/// Builds cache keys for one cached domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Prefix derived from the cached type and the field keys are taken from,
    /// e.g. `my_app::User.id`
    pub fn for_type<T: ?Sized>(field: &str) -> Self {
        Self::new(format!("{}.{}", std::any::type_name::<T>(), field))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn try_build<P: Serialize + ?Sized>(&self, param: &P) -> Result<String> {
        let encoded = serde_json::to_string(param)?;
        let mut key = String::with_capacity(self.prefix.len() + encoded.len());
        key.push_str(&self.prefix);
        key.push_str(&encoded);
        Ok(key)
    }

    /// Build a key. Parameters JSON cannot represent fall back to their
    /// `Debug` form.
    pub fn build<P: Serialize + Debug + ?Sized>(&self, param: &P) -> String {
        match self.try_build(param) {
            Ok(key) => key,
            Err(e) => {
                warn!(prefix = %self.prefix, error = %e, "Key parameter is not JSON-encodable");
                format!("{}{:?}", self.prefix, param)
            }
        }
    }
}
