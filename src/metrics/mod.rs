use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Metrics registry shared by the request handlers and the `/metrics` endpoint.
///
/// Metric names keep the `sidecache_<project>` namespace so multiple sidecars
/// can be scraped into one Prometheus without relabeling.
#[derive(Clone)]
pub struct CacheMetrics {
    pub registry: Registry,
    /// Every request the sidecar handles, cached or not.
    pub total_requests: IntCounter,
    /// Requests served from the cache store instead of the origin.
    pub cache_hits: IntCounter,
    /// Polling rounds a request consumed before winning the lock,
    /// including the winning attempt.
    pub lock_attempt_rounds: Histogram,
    /// Build info gauge, labeled by release version.
    pub build_info: IntGaugeVec,
}

impl CacheMetrics {
    pub fn new(project_name: &str) -> Self {
        let registry = Registry::new();
        let namespace = if project_name.is_empty() {
            "sidecache".to_string()
        } else {
            format!("sidecache_{}", project_name)
        };

        let total_requests = IntCounter::with_opts(
            Opts::new("all_request_hit_counter", "All request hit counter")
                .namespace(namespace.clone()),
        )
        .unwrap();

        let cache_hits = IntCounter::with_opts(
            Opts::new("cache_hit_counter", "Cache hit count").namespace(namespace.clone()),
        )
        .unwrap();

        let lock_attempt_rounds = Histogram::with_opts(
            HistogramOpts::new(
                "lock_attempt_rounds",
                "Polling rounds consumed before acquiring the lock",
            )
            .namespace(namespace)
            .buckets(vec![1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 50.0]),
        )
        .unwrap();

        let build_info = IntGaugeVec::new(
            Opts::new("sidecache_build_info", "Build info for the sidecache process"),
            &["version"],
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(total_requests.clone()))
            .unwrap();
        registry.register(Box::new(cache_hits.clone())).unwrap();
        registry
            .register(Box::new(lock_attempt_rounds.clone()))
            .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();

        Self {
            registry,
            total_requests,
            cache_hits,
            lock_attempt_rounds,
            build_info,
        }
    }

    /// Publishes the release version on the build-info gauge. Empty versions
    /// are skipped so the gauge never carries a blank label.
    pub fn set_build_info(&self, version: &str) {
        if !version.trim().is_empty() {
            self.build_info.with_label_values(&[version]).set(1);
        }
    }

    /// Encodes all registered metrics into Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap_or_default()
    }
}
