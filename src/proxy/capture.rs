use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use super::{empty_response, CacheServer};

/// Request header that opts a round into snapshotting response headers
/// alongside the body.
pub const CACHE_HEADERS_ENABLED_HEADER: &str = "sidecache-headers-enabled";

/// Multi-valued response headers collapse into one string with this
/// delimiter before being stored.
const HEADER_VALUE_DELIMITER: &str = ";";

/// One captured origin response, serialized as JSON into the cache store.
/// Written only by the leader of a coalescing round, and only after the
/// full origin body has been read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub body: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub headers: Option<HashMap<String, String>>,
    pub status_code: u16,
}

/// Only non-5xx responses are worth keeping; server faults pass through
/// untouched so clients see them live.
fn should_capture(status: StatusCode) -> bool {
    status.as_u16() < 500
}

fn snapshot_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut snapshot = HashMap::new();
    for key in headers.keys() {
        let joined = headers
            .get_all(key)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join(HEADER_VALUE_DELIMITER);
        snapshot.insert(key.as_str().to_string(), joined);
    }
    snapshot
}

impl CacheServer {
    /// Leader path: forwards the request to the origin over a fresh
    /// connection and, for cacheable responses, buffers the body, issues an
    /// asynchronous cache write, and reconstitutes the response so the
    /// leader's own client still receives the original bytes.
    ///
    /// The cache write task is spawned before this function returns, and
    /// therefore before the caller releases the lock. Nothing waits for
    /// it; its failures are logged and dropped.
    pub(crate) async fn forward_and_capture(
        &self,
        req: Request<hyper::body::Incoming>,
        capture_headers: bool,
        cache_key: String,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let origin = self.config.origin_addr.as_str();
        debug!(url = %req.uri(), origin, "proxying to origin");

        let stream = match TcpStream::connect(origin).await {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to connect to origin {}: {}", origin, e);
                return Ok(empty_response(StatusCode::BAD_GATEWAY));
            }
        };
        let io = TokioIo::new(stream);

        let (mut sender, conn) = match http1::handshake(io).await {
            Ok(handshake) => handshake,
            Err(e) => {
                error!("Handshake failed with origin {}: {}", origin, e);
                return Ok(empty_response(StatusCode::BAD_GATEWAY));
            }
        };

        // Drive the connection I/O on its own task.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Origin connection error: {:?}", e);
            }
        });

        let response = match sender.send_request(req).await {
            Ok(response) => response,
            Err(e) => {
                error!("Origin request failed: {}", e);
                return Ok(empty_response(StatusCode::BAD_GATEWAY));
            }
        };

        if !should_capture(response.status()) {
            // Server fault: stream it through untouched, cache nothing.
            return Ok(response.map(|body| body.boxed()));
        }

        let (mut parts, body) = response.into_parts();
        // The body is re-framed after buffering; the original length no
        // longer applies.
        parts.headers.remove(hyper::header::CONTENT_LENGTH);

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!("Error reading origin response body: {}", e);
                return Ok(empty_response(StatusCode::BAD_GATEWAY));
            }
        };

        let entry = CacheEntry {
            body: body_bytes.to_vec(),
            headers: capture_headers.then(|| snapshot_headers(&parts.headers)),
            status_code: parts.status.as_u16(),
        };

        let store = Arc::clone(&self.store);
        let ttl = self.config.cache_ttl;
        tokio::spawn(async move {
            let payload = match serde_json::to_vec(&entry) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(key = %cache_key, error = %e, "could not serialize cache entry");
                    return;
                }
            };
            if let Err(e) = store.set(&cache_key, payload, ttl).await {
                warn!(key = %cache_key, error = %e, "cache write dropped");
            }
        });

        Ok(Response::from_parts(
            parts,
            Full::new(body_bytes)
                .map_err(|never| match never {})
                .boxed(),
        ))
    }
}
