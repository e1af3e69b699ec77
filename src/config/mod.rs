use std::time::Duration;
use tracing::warn;

/// Default listen port when `SIDE_CACHE_PORT` is not set.
pub const DEFAULT_PORT: u16 = 9191;

/// Runtime configuration, read from the environment exactly once at startup
/// and handed to every component constructor. No ambient globals.
///
/// Missing or unparseable durations fall back to zero instead of aborting:
/// a zero `cache_ttl` disables cache writes, and a zero `lock_ttl` forces
/// `use_lock` off, so a misconfigured sidecar degrades to a plain
/// pass-through proxy rather than refusing to start.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the sidecar listens on (`0.0.0.0:<SIDE_CACHE_PORT>`).
    pub listen_addr: String,
    /// Address of the origin service (`127.0.0.1:<MAIN_CONTAINER_PORT>`).
    pub origin_addr: String,
    /// Redis `host:port`, from `REDIS_ADDRESS`.
    pub redis_address: String,
    /// Optional Redis password, from `REDIS_PASSWORD`.
    pub redis_password: Option<String>,
    /// TTL applied to captured cache entries, from `CACHE_TTL`.
    pub cache_ttl: Duration,
    /// TTL of the distributed lock; also bounds total follower wait. From `LOCK_TTL`.
    pub lock_ttl: Duration,
    /// Whether concurrent cache misses are coalesced behind the lock. From `USE_LOCK`.
    pub use_lock: bool,
    /// Tenant/environment prefix mixed into every cache key, from `CACHE_KEY_PREFIX`.
    pub cache_key_prefix: String,
    /// Metric namespace suffix, from `PROJECT_NAME`.
    pub project_name: String,
    /// Build version exposed via the build-info gauge, from `RELEASE_VERSION`.
    pub release_version: String,
    /// Tokio worker threads, from `WORKER_THREADS`.
    pub workers: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let cache_ttl = env_duration("CACHE_TTL");
        let lock_ttl = env_duration("LOCK_TTL");

        let lock_requested = std::env::var("USE_LOCK")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);
        // A zero-TTL lock cannot grant a meaningful lease and would time out
        // every follower on its first polling round.
        let use_lock = lock_requested && !lock_ttl.is_zero();
        if lock_requested && !use_lock {
            warn!("USE_LOCK is set but LOCK_TTL is zero or unset; coalescing disabled");
        }

        let listen_port = std::env::var("SIDE_CACHE_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let origin_port = std::env::var("MAIN_CONTAINER_PORT").unwrap_or_default();

        Self {
            listen_addr: format!("0.0.0.0:{}", listen_port),
            origin_addr: format!("127.0.0.1:{}", origin_port),
            redis_address: std::env::var("REDIS_ADDRESS").unwrap_or_default(),
            redis_password: std::env::var("REDIS_PASSWORD")
                .ok()
                .filter(|p| !p.is_empty()),
            cache_ttl,
            lock_ttl,
            use_lock,
            cache_key_prefix: std::env::var("CACHE_KEY_PREFIX").unwrap_or_default(),
            project_name: std::env::var("PROJECT_NAME").unwrap_or_default(),
            release_version: std::env::var("RELEASE_VERSION").unwrap_or_default(),
            workers: std::env::var("WORKER_THREADS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| {
                    std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(4)
                }),
        }
    }
}

/// Parses a duration env var like `10s` or `2m30s`. Absent or unparseable
/// values become zero, which disables the corresponding behavior instead of
/// failing startup.
fn env_duration(name: &str) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| humantime::parse_duration(&v).ok())
        .unwrap_or(Duration::ZERO)
}
