use sidecache::{config, metrics, proxy, store, telemetry};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Synchronous `main` so the configuration is read *before* the async
/// runtime is built; the worker-thread count comes from the environment.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize Telemetry (Logging)
    telemetry::init_telemetry();

    // 2. Load Configuration (one env read at startup, no ambient globals)
    let config = config::AppConfig::from_env();
    tracing::info!(
        "sidecache starting with {} worker threads... (version: {})",
        config.workers,
        if config.release_version.is_empty() {
            "unknown"
        } else {
            config.release_version.as_str()
        }
    );

    // 3. Build Tokio Runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()?;

    // 4. Start the Async Application Block
    rt.block_on(async {
        // --- Graceful Shutdown ---
        let shutdown_token = CancellationToken::new();
        let shutdown_token_signal = shutdown_token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received — initiating graceful shutdown...");
            shutdown_token_signal.cancel();
        });

        // The cache store is a hard dependency: block and retry until it
        // answers rather than serving traffic without a cache.
        let redis_url = store::redis::RedisStore::url_for(
            &config.redis_address,
            config.redis_password.as_deref(),
        );
        let redis = store::redis::RedisStore::connect_with_retry(&redis_url).await;
        tracing::info!("Redis is connected.");
        let cache_store: Arc<dyn store::CacheStore> = Arc::new(redis);

        // Prometheus metrics, exposed on the proxy port at /metrics.
        let cache_metrics = Arc::new(metrics::CacheMetrics::new(&config.project_name));
        cache_metrics.set_build_info(&config.release_version);

        tracing::info!(
            origin = %config.origin_addr,
            use_lock = config.use_lock,
            cache_key_prefix = %config.cache_key_prefix,
            "cache proxy configured"
        );

        let server = Arc::new(proxy::CacheServer::new(cache_store, cache_metrics, config));
        proxy::start_server(server, shutdown_token).await;
    });

    Ok(())
}

/// Waits for Ctrl+C or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => { tracing::info!("Received Ctrl+C"); }
            _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("Failed to listen for Ctrl+C");
    }
}
