use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CacheStore, StoreError};

/// Deletes the key only when it still holds the caller's value, so a lock
/// that expired and was re-acquired by someone else is never torn down.
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
	if redis.call("get", KEYS[1]) == ARGV[1] then
	    return redis.call("del", KEYS[1])
	else
	    return 0
	end
"#;

/// Redis-backed [`CacheStore`]. The `ConnectionManager` multiplexes and
/// reconnects on its own, so one handle is cloned per operation.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Builds a `redis://` connection URL from a `host:port` address and an
    /// optional password.
    pub fn url_for(address: &str, password: Option<&str>) -> String {
        match password {
            Some(password) => format!("redis://:{}@{}", password, address),
            None => format!("redis://{}", address),
        }
    }

    /// Connects and verifies the server answers PING before any traffic is
    /// served against it.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self { conn })
    }

    /// Blocks until the store is reachable, retrying every 3 seconds. The
    /// sidecar must not serve traffic without its cache.
    pub async fn connect_with_retry(url: &str) -> Self {
        loop {
            info!("Connecting to Redis...");
            match Self::connect(url).await {
                Ok(store) => return store,
                Err(e) => {
                    warn!(error = %e, "Redis unreachable, retrying");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        }
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        // PX rejects zero; callers are expected to have skipped zero TTLs.
        (ttl.as_millis().max(1)) as u64
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        if ttl.is_zero() {
            debug!(key, "zero TTL, skipping cache write");
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(Self::ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
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
        let mut conn = self.conn.clone();
        // SET NX replies OK when the key was set, nil when it already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(Self::ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(COMPARE_AND_DELETE_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
