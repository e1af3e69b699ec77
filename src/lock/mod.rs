use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::store::{CacheStore, StoreError};

#[derive(Debug, Error)]
pub enum LockError {
    /// Release without a matching acquire in this process. A logic error in
    /// the caller, not a store fault.
    #[error("release of a lock key that was never acquired")]
    UnknownKey,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Distributed, TTL-bounded mutual exclusion on top of a [`CacheStore`].
///
/// Ownership is proven by value: each successful acquire stores a fresh
/// UUID under the lock key, and release deletes the key only if it still
/// holds that UUID (atomically, server-side). The TTL bounds staleness when
/// a holder crashes mid-flight.
pub struct CacheLock {
    store: Arc<dyn CacheStore>,
    /// Owner values for the lock keys this process currently holds. Shared
    /// across all request handlers; guarded per-shard, never across I/O.
    owned: DashMap<String, String>,
}

impl CacheLock {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            owned: DashMap::new(),
        }
    }

    /// Attempts to take the lock. `Ok(false)` means another owner holds it,
    /// an expected and frequent outcome, not an error.
    ///
    /// The owner value is recorded locally only after the conditional set
    /// succeeds, so a losing handler can never clobber the token of the
    /// in-process winner.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let owner = Uuid::new_v4().to_string();
        let acquired = self.store.set_if_absent(key, &owner, ttl).await?;
        if acquired {
            if self.owned.insert(key.to_string(), owner).is_some() {
                // The previous hold must have expired at the store while its
                // handler was still running; its release will now no-op.
                warn!(key, "re-acquired a lock key still tracked locally");
            }
        }
        Ok(acquired)
    }

    /// Releases a previously acquired lock. The local token is dropped
    /// before the store round-trip; successful or not, a release attempt
    /// must leave no token behind to replay.
    ///
    /// `Ok(false)` means the key had already expired or been taken over by
    /// another owner; that never blocks future acquisitions.
    pub async fn release(&self, key: &str) -> Result<bool, LockError> {
        let (_, owner) = self.owned.remove(key).ok_or(LockError::UnknownKey)?;
        Ok(self.store.compare_and_delete(key, &owner).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn lock() -> (Arc<MemoryStore>, CacheLock) {
        let store = Arc::new(MemoryStore::new());
        let lock = CacheLock::new(Arc::clone(&store) as Arc<dyn CacheStore>);
        (store, lock)
    }

    #[tokio::test]
    async fn acquire_then_release_round_trips() {
        let (store, lock) = lock();
        assert!(lock.acquire("lock:a", Duration::from_secs(5)).await.unwrap());
        assert!(store.get("lock:a").await.unwrap().is_some());

        assert!(lock.release("lock:a").await.unwrap());
        assert!(store.get("lock:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let (_store, lock) = lock();
        assert!(lock.acquire("lock:a", Duration::from_secs(5)).await.unwrap());
        assert!(!lock.acquire("lock:a", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_keys_are_independent() {
        let (_store, lock) = lock();
        assert!(lock.acquire("lock:a", Duration::from_secs(5)).await.unwrap());
        assert!(lock.acquire("lock:b", Duration::from_secs(5)).await.unwrap());
        assert!(lock.release("lock:a").await.unwrap());
        assert!(lock.release("lock:b").await.unwrap());
    }

    #[tokio::test]
    async fn release_without_acquire_is_an_unknown_key() {
        let (_store, lock) = lock();
        assert!(matches!(
            lock.release("lock:never").await,
            Err(LockError::UnknownKey)
        ));
    }

    #[tokio::test]
    async fn release_does_not_remove_a_stolen_lock() {
        let (store, lock) = lock();
        assert!(lock.acquire("lock:a", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Another owner (e.g. a different process) takes over after expiry.
        assert!(store
            .set_if_absent("lock:a", "thief", Duration::from_secs(5))
            .await
            .unwrap());

        // The stale holder's release must not delete the new owner's lock.
        assert!(!lock.release("lock:a").await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap(), Some(b"thief".to_vec()));
    }

    #[tokio::test]
    async fn release_clears_bookkeeping_even_when_delete_misses() {
        let (store, lock) = lock();
        assert!(lock.acquire("lock:a", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!lock.release("lock:a").await.unwrap());
        // The token is gone; a second release is a logic error, not a replay.
        assert!(matches!(
            lock.release("lock:a").await,
            Err(LockError::UnknownKey)
        ));
        // And the key is free for anyone again.
        assert!(store
            .set_if_absent("lock:a", "next", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn concurrent_acquires_elect_a_single_winner() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let lock = Arc::new(CacheLock::new(Arc::clone(&store)));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let lock = Arc::clone(&lock);
            tasks.push(tokio::spawn(async move {
                lock.acquire("lock:contested", Duration::from_secs(5))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one concurrent acquire may win");
    }
}
