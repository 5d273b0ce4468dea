//! Error types for the tiered cache engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading, writing or resolving cached values
#[derive(Error, Debug)]
pub enum Error {
    /// Redis protocol or connection error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to check a connection out of the Redis pool
    #[error("Redis pool error: {0}")]
    Pool(String),

    /// Failed to build the Redis pool
    #[error("Redis pool creation failed: {0}")]
    PoolCreation(String),

    /// Value envelope could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The caller-supplied loader failed; the original error is kept intact
    #[error(transparent)]
    Loader(anyhow::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Error::Pool(err.to_string())
    }
}

impl From<deadpool_redis::CreatePoolError> for Error {
    fn from(err: deadpool_redis::CreatePoolError) -> Self {
        Error::PoolCreation(err.to_string())
    }
}

impl Error {
    /// Returns true if the error came out of the caller's loader
    pub fn is_loader(&self) -> bool {
        matches!(self, Error::Loader(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("database unavailable")]
    struct DbDown;

    #[test]
    fn test_loader_error_keeps_original() {
        let err = Error::Loader(anyhow::Error::new(DbDown));
        assert!(err.is_loader());
        assert_eq!(err.to_string(), "database unavailable");

        match err {
            Error::Loader(inner) => assert!(inner.downcast_ref::<DbDown>().is_some()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_config_error_display() {
        let err = Error::Config("max_entries must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: max_entries must be positive"
        );
        assert!(!err.is_loader());
    }
}
