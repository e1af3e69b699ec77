//! sidecache: a coalescing HTTP cache sidecar.
//!
//! Sits in front of an origin HTTP service, serves previously captured
//! responses out of a shared cache store, and coalesces concurrent misses
//! for the same logical resource so that only one request per lock key
//! reaches the origin at a time. Followers poll the cache with a bounded
//! backoff and time out with 504 if it never fills.

pub mod config;
pub mod keys;
pub mod lock;
pub mod metrics;
pub mod proxy;
pub mod store;
pub mod telemetry;
