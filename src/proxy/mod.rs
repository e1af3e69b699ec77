use bytes::Bytes;
use futures_util::FutureExt;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod capture;

use capture::{CacheEntry, CACHE_HEADERS_ENABLED_HEADER};

use crate::config::AppConfig;
use crate::keys::KeyResolver;
use crate::lock::CacheLock;
use crate::metrics::CacheMetrics;
use crate::store::CacheStore;

/// Scrape endpoint; bypasses the cache and lock logic entirely.
const METRICS_PATH: &str = "/metrics";

/// Follower polling schedule: ten quick 100 ms rounds, then easing to
/// 500 ms for as long as the wait bound allows.
const EARLY_BACKOFF: Duration = Duration::from_millis(100);
const LATE_BACKOFF: Duration = Duration::from_millis(500);
const EARLY_ROUNDS: u32 = 10;

/// Backoff before polling round `attempt` (zero-based count of rounds
/// already completed).
pub fn backoff_for(attempt: u32) -> Duration {
    if attempt < EARLY_ROUNDS {
        EARLY_BACKOFF
    } else {
        LATE_BACKOFF
    }
}

/// The request-handling core: checks the cache, elects a leader per lock
/// key on concurrent misses, forwards to the origin, and captures the
/// response for followers to pick up.
pub struct CacheServer {
    store: Arc<dyn CacheStore>,
    lock: CacheLock,
    metrics: Arc<CacheMetrics>,
    resolver: KeyResolver,
    config: AppConfig,
}

impl CacheServer {
    pub fn new(store: Arc<dyn CacheStore>, metrics: Arc<CacheMetrics>, config: AppConfig) -> Self {
        Self {
            lock: CacheLock::new(Arc::clone(&store)),
            resolver: KeyResolver::new(config.cache_key_prefix.clone()),
            store,
            metrics,
            config,
        }
    }

    /// Request boundary: counts the request, short-circuits the scrape
    /// path, and contains any panic from the handling below as a 500 so a
    /// single bad request can never take the process down.
    pub async fn handle(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        if req.uri().path() == METRICS_PATH {
            return Ok(self.metrics_response());
        }

        self.metrics.total_requests.inc();

        match AssertUnwindSafe(self.dispatch(req)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_reason(panic.as_ref());
                error!(%reason, "recovered from panic while handling request");
                Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, reason))
            }
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let uri = req.uri().clone();
        debug!(url = %uri, "handle request");

        let keys = self.resolver.resolve(uri.path(), uri.query());
        let capture_headers = req
            .headers()
            .get(CACHE_HEADERS_ENABLED_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        if !self.config.use_lock {
            // No coalescing: a miss goes straight to the origin.
            if let Some(entry) = self.check_cache(&keys.cache_key).await {
                return Ok(self.serve_from_cache(entry, &uri));
            }
            return self
                .forward_and_capture(req, capture_headers, keys.cache_key)
                .await;
        }

        let mut attempt: u32 = 0;
        loop {
            debug!(key = %keys.cache_key, round = attempt + 1, "checking the cache");
            if let Some(entry) = self.check_cache(&keys.cache_key).await {
                return Ok(self.serve_from_cache(entry, &uri));
            }

            match self.lock.acquire(&keys.lock_key, self.config.lock_ttl).await {
                Ok(true) => {
                    // Leader: one round trip to the origin, everyone else
                    // reads the captured entry.
                    self.metrics
                        .lock_attempt_rounds
                        .observe(f64::from(attempt + 1));
                    debug!(key = %keys.lock_key, rounds = attempt + 1, "lock acquired, forwarding to origin");

                    // The fetch, capture, and release run on their own task
                    // so they complete even if this client disconnects
                    // mid-flight; the lock must never wait for its TTL just
                    // because the leader's caller went away.
                    let server = Arc::clone(&self);
                    let lock_key = keys.lock_key.clone();
                    let cache_key = keys.cache_key.clone();
                    let leader = tokio::spawn(async move {
                        let outcome = AssertUnwindSafe(server.forward_and_capture(
                            req,
                            capture_headers,
                            cache_key,
                        ))
                        .catch_unwind()
                        .await;

                        // Release fires exactly once on every leader exit
                        // path, recovered panics included.
                        match server.lock.release(&lock_key).await {
                            Ok(true) => {}
                            Ok(false) => {
                                debug!(key = %lock_key, "lock already expired or taken over")
                            }
                            Err(e) => warn!(key = %lock_key, error = %e, "could not release lock"),
                        }
                        outcome
                    });

                    return match leader.await {
                        Ok(Ok(result)) => result,
                        Ok(Err(panic)) => {
                            let reason = panic_reason(panic.as_ref());
                            error!(%reason, "recovered from panic on the leader path");
                            Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, reason))
                        }
                        Err(e) => {
                            error!(error = %e, "leader task failed");
                            Ok(empty_response(StatusCode::INTERNAL_SERVER_ERROR))
                        }
                    };
                }
                // Held elsewhere: the expected follower outcome.
                Ok(false) => debug!(key = %keys.lock_key, "lock is held, polling the cache"),
                Err(e) => {
                    warn!(key = %keys.lock_key, error = %e, "lock acquire fault, treating as held")
                }
            }

            let backoff = backoff_for(attempt);
            if backoff >= self.config.lock_ttl {
                // Waiting any longer than the lock's own lease is pointless.
                warn!(url = %uri, rounds = attempt + 1, "gave up waiting for the cache to fill");
                return Ok(empty_response(StatusCode::GATEWAY_TIMEOUT));
            }
            debug!(key = %keys.lock_key, backoff_ms = backoff.as_millis() as u64, "sleeping");
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// A store fault or an undecodable entry is a miss, never a request
    /// failure; the origin can always answer.
    async fn check_cache(&self, cache_key: &str) -> Option<CacheEntry> {
        match self.store.get(cache_key).await {
            Ok(Some(raw)) => match serde_json::from_slice(&raw) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    error!(key = %cache_key, error = %e, "undecodable cache entry, treating as a miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %cache_key, error = %e, "cache read fault, treating as a miss");
                None
            }
        }
    }

    fn serve_from_cache(
        &self,
        entry: CacheEntry,
        uri: &Uri,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        debug!(url = %uri, "serve from cache");

        let mut response = Response::new(
            Full::new(Bytes::from(entry.body))
                .map_err(|never| match never {})
                .boxed(),
        );
        *response.status_mut() =
            StatusCode::from_u16(entry.status_code).unwrap_or(StatusCode::OK);

        let headers = response.headers_mut();
        if let Ok(value) = uri.to_string().parse() {
            headers.insert(
                hyper::header::HeaderName::from_static("x-cache-response-for"),
                value,
            );
        }
        headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json;charset=UTF-8"),
        );
        if let Some(captured) = entry.headers {
            for (key, value) in captured {
                if let (Ok(name), Ok(value)) = (
                    hyper::header::HeaderName::from_bytes(key.as_bytes()),
                    hyper::header::HeaderValue::from_str(&value),
                ) {
                    headers.insert(name, value);
                }
            }
        }

        self.metrics.cache_hits.inc();
        response
    }

    fn metrics_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(StatusCode::OK)
            .header(
                hyper::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )
            .body(
                Full::new(Bytes::from(self.metrics.encode()))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap()
    }
}

/// Binds the configured listen address and serves until shutdown.
pub async fn start_server(server: Arc<CacheServer>, shutdown: CancellationToken) {
    let addr: SocketAddr = server
        .config
        .listen_addr
        .parse()
        .expect("Invalid listen address");
    let listener = TcpListener::bind(&addr)
        .await
        .expect("Could not bind listen address");
    serve_on(listener, server, shutdown).await;
}

/// Accept loop: one task per connection, hyper HTTP/1 per stream. Stops
/// accepting when the shutdown token fires; in-flight requests finish on
/// their own tasks.
pub async fn serve_on(
    listener: TcpListener,
    server: Arc<CacheServer>,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("sidecache listening on {}", addr);
    }

    loop {
        let (stream, peer) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(s) => s,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("sidecache shutting down gracefully — no new connections accepted.");
                break;
            }
        };

        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req| {
                let server = Arc::clone(&server);
                async move { server.handle(req).await }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                debug!("Error serving connection from {}: {:?}", peer, e);
            }
        });
    }
}

/// Helper to create standard empty-body responses for statuses like 504/502.
pub(crate) fn empty_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(
            http_body_util::Empty::<Bytes>::new()
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap()
}

pub(crate) fn text_response(
    status: StatusCode,
    body: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap()
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_100ms_for_the_first_ten_rounds() {
        for attempt in 0..10 {
            assert_eq!(backoff_for(attempt), Duration::from_millis(100));
        }
    }

    #[test]
    fn backoff_eases_to_500ms_from_round_eleven() {
        assert_eq!(backoff_for(10), Duration::from_millis(500));
        assert_eq!(backoff_for(11), Duration::from_millis(500));
        assert_eq!(backoff_for(1000), Duration::from_millis(500));
    }

    #[test]
    fn follower_wait_is_bounded_by_the_lock_ttl() {
        // The loop gives up as soon as the next backoff would meet or
        // exceed the lock TTL.
        let lock_ttl = Duration::from_millis(300);
        let mut total = Duration::ZERO;
        let mut attempt = 0;
        loop {
            let backoff = backoff_for(attempt);
            if backoff >= lock_ttl {
                break;
            }
            total += backoff;
            attempt += 1;
            assert!(attempt < 100, "loop must terminate");
        }
        // Ten 100 ms rounds, then 500 ms >= 300 ms stops the polling.
        assert_eq!(attempt, 10);
        assert_eq!(total, Duration::from_millis(1000));
    }

    #[test]
    fn tiny_lock_ttl_terminates_before_the_first_sleep() {
        // With a lock TTL at or below the first backoff, a follower times
        // out immediately instead of ever sleeping.
        let lock_ttl = Duration::from_millis(50);
        assert!(backoff_for(0) >= lock_ttl);
    }

    #[test]
    fn panic_reason_extracts_str_and_string_payloads() {
        assert_eq!(panic_reason(&"boom"), "boom");
        assert_eq!(panic_reason(&"boom".to_string()), "boom");
        assert_eq!(panic_reason(&42_u32), "unknown panic");
    }
}
