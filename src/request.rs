//! Request options and the normalized response shape.

use crate::error::{ApiError, Result};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// True for verbs the offline queue and the invalidation rules care about.
pub fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Per-call cache behavior.
#[derive(Debug, Clone, Default)]
pub enum CachePolicy {
    /// GETs use the endpoint's TTL tier; mutating verbs are not cached.
    #[default]
    Default,
    /// Bypass the cache entirely for this call.
    Disabled,
    /// Explicit settings; also the opt-in for caching a mutating verb.
    Custom {
        ttl: Option<Duration>,
        key: Option<String>,
        skip_params: Vec<String>,
        persistent: Option<bool>,
    },
}

/// Options for a single request. Immutable once handed to the client;
/// interceptors work on a derived context, not on this value.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Skip the auth-token lifecycle for this call.
    pub skip_auth: bool,
    /// Whether transient failures are retried. Default true.
    pub retryable: bool,
    /// Per-call timeout override.
    pub timeout: Option<Duration>,
    /// Keep this call out of the request log.
    pub skip_logging: bool,
    /// Never queue this call, even offline.
    pub skip_queue: bool,
    /// Extra headers for this call.
    pub headers: HeaderMap,
    /// Query parameters. BTreeMap so serialization order is canonical.
    pub params: BTreeMap<String, String>,
    pub cache: CachePolicy,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            skip_auth: false,
            retryable: true,
            timeout: None,
            skip_logging: false,
            skip_queue: false,
            headers: HeaderMap::new(),
            params: BTreeMap::new(),
            cache: CachePolicy::Default,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_logging(mut self) -> Self {
        self.skip_logging = true;
        self
    }

    pub fn skip_queue(mut self) -> Self {
        self.skip_queue = true;
        self
    }

    pub fn cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.cache = CachePolicy::Disabled;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Adds a header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| ApiError::internal(format!("invalid header name: {e}")))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| ApiError::internal(format!("invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

/// The normalized shape every successful call resolves to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiResponse {
    pub fn ok(data: Option<serde_json::Value>, message: Option<String>) -> Self {
        Self {
            success: true,
            data,
            message,
        }
    }

    /// The queued-acknowledgement outcome for a mutating call made offline.
    /// Not an error: the request was accepted for replay.
    pub fn queued(queue_id: &str) -> Self {
        Self {
            success: false,
            data: Some(serde_json::json!({ "queue_id": queue_id })),
            message: Some("offline: request queued for replay".to_string()),
        }
    }

    /// The queue id when this response is a queued acknowledgement.
    pub fn queue_id(&self) -> Option<&str> {
        self.data.as_ref()?.get("queue_id")?.as_str()
    }

    /// Deserializes `data` into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| ApiError::internal("response has no data payload"))?;
        serde_json::from_value(data)
            .map_err(|e| ApiError::internal(format!("response payload mismatch: {e}")))
    }

    /// Builds a response from a raw JSON body, unwrapping the `{data, message}`
    /// envelope when present.
    pub fn from_body(body: serde_json::Value) -> Self {
        if let serde_json::Value::Object(ref map) = body {
            if map.contains_key("data") {
                let message = map
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string);
                return Self::ok(map.get("data").cloned(), message);
            }
        }
        Self::ok(Some(body), None)
    }
}
