use md5::{Digest, Md5};

/// Lock keys live in their own keyspace so they can never collide with the
/// hex-encoded cache keys.
const LOCK_KEY_PREFIX: &str = "lock:";

/// How many leading path segments identify the logical resource a lock
/// covers. Coarser than the cache key on purpose: variants of the same
/// expensive computation (different query parameters under one resource)
/// coalesce behind a single lock.
const LOCK_PATH_SEGMENTS: usize = 2;

/// Keys derived for one request: the exact cache slot and the coarser lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKeys {
    pub cache_key: String,
    pub lock_key: String,
}

/// Derives cache and lock keys from a request's path and query. Pure string
/// work, no I/O; callers hand in an already-parsed URI.
pub struct KeyResolver {
    prefix: String,
}

impl KeyResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn resolve(&self, path: &str, query: Option<&str>) -> ResolvedKeys {
        ResolvedKeys {
            cache_key: self.cache_key(path, query),
            lock_key: lock_key(path),
        }
    }

    /// 128-bit hex digest over `prefix + "/" + path + "?" + canonical query`.
    /// Two requests that differ only in query parameter order hash the same.
    pub fn cache_key(&self, path: &str, query: Option<&str>) -> String {
        let canonical = canonical_query(query.unwrap_or(""));
        let mut hasher = Md5::new();
        hasher.update(self.prefix.as_bytes());
        hasher.update(b"/");
        hasher.update(path.as_bytes());
        hasher.update(b"?");
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Re-encodes a query string with its pairs sorted by key. The sort is
/// stable, so repeated values of one key keep their arrival order.
pub fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// `lock:` + the first two path segments. All requests under one resource
/// prefix contend for the same lock.
pub fn lock_key(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .take(LOCK_PATH_SEGMENTS)
        .collect();
    format!("{}{}", LOCK_KEY_PREFIX, segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_ignores_query_parameter_order() {
        let resolver = KeyResolver::new("test");
        let a = resolver.cache_key("/x", Some("y=1&z=2"));
        let b = resolver.cache_key("/x", Some("z=2&y=1"));
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_is_deterministic_across_calls() {
        let resolver = KeyResolver::new("test");
        let first = resolver.cache_key("/api/v1/items", Some("limit=10&offset=0"));
        let second = resolver.cache_key("/api/v1/items", Some("limit=10&offset=0"));
        assert_eq!(first, second);
        assert_eq!(first.len(), 32, "128-bit digest rendered as hex");
    }

    #[test]
    fn cache_key_distinguishes_paths_queries_and_prefixes() {
        let resolver = KeyResolver::new("test");
        let base = resolver.cache_key("/x", Some("y=1"));
        assert_ne!(base, resolver.cache_key("/y", Some("y=1")));
        assert_ne!(base, resolver.cache_key("/x", Some("y=2")));
        assert_ne!(base, KeyResolver::new("other").cache_key("/x", Some("y=1")));
    }

    #[test]
    fn multi_valued_parameters_keep_all_values_in_order() {
        let canonical = canonical_query("b=2&a=first&b=1&a=second");
        assert_eq!(canonical, "a=first&a=second&b=2&b=1");
    }

    #[test]
    fn duplicated_parameters_hash_like_their_reordering() {
        let resolver = KeyResolver::new("");
        let a = resolver.cache_key("/r", Some("a=1&b=2&a=2"));
        let b = resolver.cache_key("/r", Some("b=2&a=1&a=2"));
        assert_eq!(a, b);
    }

    #[test]
    fn lock_key_takes_first_two_path_segments() {
        assert_eq!(lock_key("/0xABC/info"), "lock:0xABC/info");
        assert_eq!(
            lock_key("/api/v1/actions/recent"),
            "lock:api/v1",
            "deeper paths coalesce under their two-segment prefix"
        );
        assert_eq!(lock_key("/solo"), "lock:solo");
        assert_eq!(lock_key("/"), "lock:");
    }

    #[test]
    fn lock_keys_and_cache_keys_never_share_a_keyspace() {
        let resolver = KeyResolver::new("test");
        let cache_key = resolver.cache_key("/x", None);
        assert!(!cache_key.starts_with(LOCK_KEY_PREFIX));
        assert!(lock_key("/x").starts_with(LOCK_KEY_PREFIX));
    }

    #[test]
    fn empty_query_and_missing_query_are_the_same_resource() {
        let resolver = KeyResolver::new("test");
        assert_eq!(
            resolver.cache_key("/x", None),
            resolver.cache_key("/x", Some(""))
        );
    }
}
