//! TTL response cache with rule-based invalidation.
//!
//! GET responses are cached under a canonical key derived from method,
//! endpoint path, and filtered query parameters, so semantically identical
//! requests collapse to one entry regardless of cache-busting noise or param
//! insertion order. Entries carry an expiry and the API version; either
//! mismatch invalidates on read. A static rule table evicts related entries
//! after every successful mutating call.
//!
//! Persistent entries are written through to durable storage under a `cache:`
//! prefix and reloaded at construction. Quota failures degrade the entry to
//! memory-only rather than failing the call.

use crate::error::now_ms;
use crate::request::ApiResponse;
use crate::storage::{Storage, StorageError};
use http::Method;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PERSIST_PREFIX: &str = "cache:";

/// TTL tiers. Short is the default; endpoints below opt into longer tiers.
pub const SHORT_TTL: Duration = Duration::from_secs(5 * 60);
pub const MEDIUM_TTL: Duration = Duration::from_secs(30 * 60);
pub const LONG_TTL: Duration = Duration::from_secs(120 * 60);

const MEDIUM_TTL_ENDPOINTS: &[&str] = &["/user/profile", "/transactions", "/contacts", "/wallet"];
const LONG_TTL_ENDPOINTS: &[&str] = &["/settings", "/config"];
const PERSISTENT_ENDPOINTS: &[&str] = &["/user/profile", "/transactions", "/contacts", "/settings"];

/// Query params stripped before key derivation (cache busters, nonces).
pub const DEFAULT_SKIP_PARAMS: &[&str] = &["_t", "_ts", "timestamp", "nonce"];

/// The TTL tier for an endpoint, by path prefix.
pub fn ttl_for_endpoint(endpoint: &str) -> Duration {
    let path = endpoint.split('?').next().unwrap_or(endpoint);
    if LONG_TTL_ENDPOINTS.iter().any(|p| path.starts_with(p)) {
        LONG_TTL
    } else if MEDIUM_TTL_ENDPOINTS.iter().any(|p| path.starts_with(p)) {
        MEDIUM_TTL
    } else {
        SHORT_TTL
    }
}

/// Whether entries for this endpoint survive process restart.
pub fn is_persistent_endpoint(endpoint: &str) -> bool {
    let path = endpoint.split('?').next().unwrap_or(endpoint);
    PERSISTENT_ENDPOINTS.iter().any(|p| path.starts_with(p))
}

/// Derives the canonical cache key for a request.
///
/// Query parameters embedded in the endpoint are parsed out and merged with
/// the explicit params; skip params are dropped; the remainder is serialized
/// in sorted order. `GET /tx?b=2&a=1&_t=99` and `GET /tx?a=1&b=2` produce the
/// same key.
pub fn build_cache_key(
    method: &Method,
    endpoint: &str,
    params: &BTreeMap<String, String>,
    skip_params: &[String],
) -> String {
    let (path, query) = match endpoint.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (endpoint, None),
    };

    let mut merged: BTreeMap<String, String> = params.clone();
    if let Some(query) = query {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            merged.insert(k.to_string(), v.to_string());
        }
    }
    merged.retain(|k, _| {
        !DEFAULT_SKIP_PARAMS.contains(&k.as_str()) && !skip_params.iter().any(|s| s == k)
    });

    let mut key = format!("{method}:{path}");
    if !merged.is_empty() {
        let qs: Vec<String> = merged.iter().map(|(k, v)| format!("{k}={v}")).collect();
        key.push('?');
        key.push_str(&qs.join("&"));
    }
    key
}

/// `*`-wildcard match, anchored at both ends.
pub(crate) fn pattern_matches(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = text;

    let first = segments[0];
    if !rest.starts_with(first) {
        return false;
    }
    rest = &rest[first.len()..];

    let last_idx = segments.len() - 1;
    for seg in &segments[1..last_idx] {
        if seg.is_empty() {
            continue;
        }
        match rest.find(seg) {
            Some(i) => rest = &rest[i + seg.len()..],
            None => return false,
        }
    }

    let last = segments[last_idx];
    last.is_empty() || rest.ends_with(last)
}

/// One cached response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: ApiResponse,
    pub expires_at_ms: u64,
    pub persistent: bool,
    pub version: String,
}

impl CacheEntry {
    fn is_fresh(&self, api_version: &str) -> bool {
        now_ms() < self.expires_at_ms && self.version == api_version
    }
}

/// Counters surfaced through the cache admin interface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub persistent_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Maps a mutation to the cache-key patterns it invalidates.
#[derive(Debug, Clone)]
pub struct InvalidationRule {
    pub methods: Vec<Method>,
    pub endpoint_prefix: String,
    pub evict: Vec<String>,
}

fn mutating(prefix: &str, evict: &[&str]) -> InvalidationRule {
    InvalidationRule {
        methods: vec![Method::POST, Method::PUT, Method::PATCH, Method::DELETE],
        endpoint_prefix: prefix.to_string(),
        evict: evict.iter().map(|s| s.to_string()).collect(),
    }
}

fn default_rules() -> Vec<InvalidationRule> {
    vec![
        mutating(
            "/transactions",
            &["GET:/transactions*", "GET:/dashboard/stats*"],
        ),
        mutating("/contacts", &["GET:/contacts*"]),
        mutating(
            "/disputes",
            &["GET:/disputes*", "GET:/dashboard/stats*"],
        ),
        mutating("/documents", &["GET:/documents*"]),
        InvalidationRule {
            methods: vec![Method::PUT, Method::PATCH],
            endpoint_prefix: "/user/profile".to_string(),
            evict: vec!["GET:/user/profile*".to_string()],
        },
        InvalidationRule {
            methods: vec![Method::PUT, Method::PATCH],
            endpoint_prefix: "/settings".to_string(),
            evict: vec!["GET:/settings*".to_string()],
        },
        InvalidationRule {
            methods: vec![Method::POST],
            endpoint_prefix: "/wallet".to_string(),
            evict: vec!["GET:/wallet*".to_string(), "GET:/dashboard/stats*".to_string()],
        },
    ]
}

/// Key-derived TTL store for normalized responses.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    storage: Arc<dyn Storage>,
    api_version: String,
    rules: Vec<InvalidationRule>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    /// Builds the cache, reloading persistent entries that are still fresh
    /// for the current API version.
    pub fn new(storage: Arc<dyn Storage>, api_version: impl Into<String>) -> Self {
        let api_version = api_version.into();
        let mut entries = HashMap::new();

        for stored_key in storage.keys() {
            let Some(key) = stored_key.strip_prefix(PERSIST_PREFIX) else {
                continue;
            };
            match storage
                .get(&stored_key)
                .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok())
            {
                Some(entry) if entry.is_fresh(&api_version) => {
                    entries.insert(key.to_string(), entry);
                }
                _ => storage.remove(&stored_key),
            }
        }

        Self {
            entries: Mutex::new(entries),
            storage,
            api_version,
            rules: default_rules(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Looks up a fresh entry. Stale and version-mismatched entries are
    /// evicted and count as misses.
    pub fn get(&self, key: &str) -> Option<ApiResponse> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get(key) {
            Some(entry) if entry.is_fresh(&self.api_version) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.storage.remove(&format!("{PERSIST_PREFIX}{key}"));
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a response. Persistent entries are written through to durable
    /// storage; a quota failure degrades them to memory-only.
    pub fn set(&self, key: &str, value: ApiResponse, ttl: Duration, persistent: bool) {
        let mut entry = CacheEntry {
            value,
            expires_at_ms: now_ms() + ttl.as_millis() as u64,
            persistent,
            version: self.api_version.clone(),
        };

        if entry.persistent {
            match serde_json::to_string(&entry) {
                Ok(raw) => {
                    if let Err(e) = self.storage.set(&format!("{PERSIST_PREFIX}{key}"), &raw) {
                        if matches!(e, StorageError::QuotaExceeded) {
                            tracing::warn!(key, "cache storage quota exceeded, keeping entry in memory only");
                        } else {
                            tracing::warn!(key, error = %e, "failed to persist cache entry");
                        }
                        entry.persistent = false;
                    }
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "failed to encode cache entry");
                    entry.persistent = false;
                }
            }
        }

        self.entries
            .lock()
            .expect("cache poisoned")
            .insert(key.to_string(), entry);
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().expect("cache poisoned").remove(key);
        self.storage.remove(&format!("{PERSIST_PREFIX}{key}"));
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        entries.clear();
        for key in self.storage.keys() {
            if key.starts_with(PERSIST_PREFIX) {
                self.storage.remove(&key);
            }
        }
    }

    /// Evicts every entry whose key matches the `*`-wildcard pattern.
    /// Returns the number evicted.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut entries = self.entries.lock().expect("cache poisoned");
        let matching: Vec<String> = entries
            .keys()
            .filter(|k| pattern_matches(pattern, k))
            .cloned()
            .collect();
        for key in &matching {
            entries.remove(key);
            self.storage.remove(&format!("{PERSIST_PREFIX}{key}"));
        }
        self.evictions
            .fetch_add(matching.len() as u64, Ordering::Relaxed);
        matching.len()
    }

    /// Runs the static rule table after a successful mutating call.
    pub fn apply_mutation_rules(&self, method: &Method, endpoint: &str) {
        let path = endpoint.split('?').next().unwrap_or(endpoint);
        for rule in &self.rules {
            if rule.methods.contains(method) && path.starts_with(&rule.endpoint_prefix) {
                for pattern in &rule.evict {
                    let evicted = self.invalidate(pattern);
                    if evicted > 0 {
                        tracing::debug!(%method, endpoint, pattern = %pattern, evicted, "cache invalidated by mutation");
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().expect("cache poisoned");
        CacheStats {
            entries: entries.len(),
            persistent_entries: entries.values().filter(|e| e.persistent).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
