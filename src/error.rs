//! Store boundary errors

use thiserror::Error;

/// Failure talking to the shared store.
///
/// Nothing here propagates past the coordinator or hub: reads degrade to
/// conservative defaults and writes are logged and dropped.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store command timed out after {0}ms")]
    Timeout(u64),

    #[error("malformed record: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
