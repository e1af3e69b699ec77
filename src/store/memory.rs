use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{CacheStore, StoreError};

struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        Self { data, expires_at }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process [`CacheStore`] with lazy expiry on read. Atomicity of the
/// conditional operations comes from the DashMap entry API, which is enough
/// for a single process; use the Redis backend when multiple sidecar
/// instances share one cache.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(stored) = self.entries.get(key) {
            if !stored.expired() {
                return Ok(Some(stored.data.clone()));
            }
        }
        // Expired entries are dropped on the read that discovers them.
        self.entries.remove_if(key, |_, stored| stored.expired());
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        if ttl.is_zero() {
            debug!(key, "zero TTL, skipping cache write");
            return Ok(());
        }
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        if ttl.is_zero() {
            debug!(key, "zero TTL, refusing conditional set");
            return Ok(false);
        }
        let stored = StoredValue::new(value.as_bytes().to_vec(), ttl);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().expired() => {
                occupied.insert(stored);
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let removed = self
            .entries
            .remove_if(key, |_, stored| {
                !stored.expired() && stored.data == expected.as_bytes()
            });
        Ok(removed.is_some())
    }
}
