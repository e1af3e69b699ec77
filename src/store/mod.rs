pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Fault talking to the backing store. Expected outcomes (missing key, key
/// already present) are expressed in the return values, never as errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// The key-value service backing both the response cache and the distributed
/// lock. Implementations must make `set_if_absent` and `compare_and_delete`
/// atomic with respect to all other clients of the store, in and out of
/// process. Cross-process mutual exclusion rests entirely on these two.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetches a value. `Ok(None)` is a plain miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores a value with an expiry. A zero TTL skips the write entirely,
    /// effectively disabling caching for this store.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Stores `value` under `key` with an expiry only if the key does not
    /// exist. Returns whether the value was set. A zero TTL never sets.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Deletes `key` only if its current value equals `expected`, as a single
    /// atomic operation. Returns whether a deletion happened.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
}
