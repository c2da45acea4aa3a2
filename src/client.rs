//! The core API client.
//!
//! [`ApiClient`] orchestrates the whole pipeline: offline queueing, cache
//! lookup, auth-token resolution, interceptors, the network call under a
//! cancellation scope, retries, error normalization, cache writes and
//! invalidation, and terminal logging.
//!
//! The client is a cheap [`Clone`] over shared internals and is meant to be
//! built once at process start with [`ClientBuilder`] and passed around
//! explicitly.

use crate::auth::{RefreshFn, TokenStore};
use crate::cache::{
    build_cache_key, is_persistent_endpoint, pattern_matches, ttl_for_endpoint, CacheStats,
    ResponseCache,
};
use crate::config::ClientConfig;
use crate::connectivity::{AlwaysOnline, Connectivity};
use crate::error::{ApiError, Result};
use crate::interceptor::{InterceptorPipeline, RequestContext, ResponseContext};
use crate::logger::{LogEvent, LogKind, RequestLog};
use crate::queue::{OfflineQueue, ProcessReport, QueueStatus, QueuedRequest};
use crate::request::{is_mutating, ApiResponse, CachePolicy, RequestOptions};
use crate::retry::{BackoffPolicy, RetryEngine};
use crate::storage::{MemoryStorage, Storage};
use http::Method;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use url::Url;

type UnauthorizedHandler = Arc<dyn Fn() + Send + Sync>;

/// The API client.
///
/// # Examples
///
/// ```no_run
/// use moorage::{ApiClient, RequestOptions};
///
/// # async fn example() -> Result<(), moorage::ApiError> {
/// let client = ApiClient::builder()
///     .base_url("https://api.example.com")?
///     .api_version("v2")
///     .build()?;
///
/// let balance = client
///     .get("/wallet/0xabc/balance", RequestOptions::new())
///     .await?;
/// println!("balance payload: {:?}", balance.data);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    config: ClientConfig,
    interceptors: InterceptorPipeline,
    retry: RetryEngine,
    cache: ResponseCache,
    queue: OfflineQueue,
    auth: TokenStore,
    log: RequestLog,
    connectivity: Arc<dyn Connectivity>,
    on_unauthorized: Option<UnauthorizedHandler>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

struct InFlight {
    endpoint: String,
    cancel: Arc<Notify>,
}

/// What perform() hands back: the normalized response plus the HTTP status
/// for logging.
struct NetOutcome {
    response: ApiResponse,
    status: u16,
}

/// Resolved cache behavior for one call.
struct CachePlan {
    key: String,
    ttl: Duration,
    persistent: bool,
}

impl ApiClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Makes a request through the full pipeline.
    ///
    /// Resolves to the normalized response or a normalized error. A mutating
    /// call made while offline resolves to a queued acknowledgement
    /// (`success: false` plus a queue id); queued is an accepted outcome,
    /// not a fault.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let started = Instant::now();

        if is_mutating(&method) && !options.skip_queue && !self.inner.connectivity.is_online() {
            return self.enqueue_offline(&method, endpoint, body, &options);
        }

        let cache_plan = self.cache_plan(&method, endpoint, &options);
        if let Some(plan) = &cache_plan {
            if let Some(hit) = self.inner.cache.get(&plan.key) {
                if !options.skip_logging {
                    self.inner
                        .log
                        .record(LogEvent::new(LogKind::CacheHit, method.as_str(), endpoint));
                }
                return Ok(hit);
            }
        }

        let token = if options.skip_auth {
            None
        } else {
            self.inner.auth.bearer().await?
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let cancel = Arc::new(Notify::new());
        self.inner
            .in_flight
            .lock()
            .expect("in-flight map poisoned")
            .insert(
                request_id.clone(),
                InFlight {
                    endpoint: endpoint.to_string(),
                    cancel: cancel.clone(),
                },
            );

        if !options.skip_logging {
            let mut event = LogEvent::new(LogKind::Request, method.as_str(), endpoint);
            if self.inner.config.verbose {
                if let Some(body) = &body {
                    event = event.body(body.to_string());
                }
            }
            self.inner.log.record(event);
        }

        let context = format!("{method} {endpoint}");
        let attempts = async {
            if options.retryable {
                let mut attempt = 0u32;
                self.inner
                    .retry
                    .execute(&context, || {
                        attempt += 1;
                        if attempt > 1 && !options.skip_logging {
                            self.inner.log.record(
                                LogEvent::new(LogKind::Retry, method.as_str(), endpoint)
                                    .message(format!("attempt {attempt}")),
                            );
                        }
                        self.perform(&method, endpoint, &body, &options, &token, &request_id)
                    })
                    .await
            } else {
                self.perform(&method, endpoint, &body, &options, &token, &request_id)
                    .await
            }
        };
        // Cancellation drops the whole attempt chain, including any backoff
        // sleep, so the caller sees the abort immediately.
        let result = tokio::select! {
            result = attempts => result,
            _ = cancel.notified() => Err(ApiError::timeout("request cancelled")),
        };

        self.inner
            .in_flight
            .lock()
            .expect("in-flight map poisoned")
            .remove(&request_id);

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(outcome) => {
                if let Some(plan) = &cache_plan {
                    self.inner
                        .cache
                        .set(&plan.key, outcome.response.clone(), plan.ttl, plan.persistent);
                }
                if is_mutating(&method) {
                    self.inner.cache.apply_mutation_rules(&method, endpoint);
                }
                if !options.skip_logging {
                    let mut event = LogEvent::new(LogKind::Response, method.as_str(), endpoint)
                        .status(outcome.status)
                        .duration_ms(duration_ms);
                    if self.inner.config.verbose {
                        if let Some(data) = &outcome.response.data {
                            event = event.body(data.to_string());
                        }
                    }
                    self.inner.log.record(event);
                }
                Ok(outcome.response)
            }
            Err(err) => {
                if !options.skip_logging {
                    self.inner.log.record(
                        LogEvent::new(LogKind::Error, method.as_str(), endpoint)
                            .status(err.status)
                            .duration_ms(duration_ms)
                            .message(format!("{}: {}", err.code, err.message)),
                    );
                }
                Err(err)
            }
        }
    }

    /// One network attempt: interceptors, the wire call, response
    /// interceptors, and normalization. The retry engine re-invokes this
    /// whole function.
    async fn perform(
        &self,
        method: &Method,
        endpoint: &str,
        body: &Option<serde_json::Value>,
        options: &RequestOptions,
        token: &Option<String>,
        request_id: &str,
    ) -> Result<NetOutcome> {
        let ctx = RequestContext {
            method: method.clone(),
            endpoint: endpoint.to_string(),
            headers: options.headers.clone(),
            params: options.params.clone(),
            body: body.clone(),
            timeout: options.timeout.unwrap_or(self.inner.config.timeout),
            request_id: request_id.to_string(),
            auth_token: token.clone(),
        };
        let ctx = self.inner.interceptors.apply_request(ctx)?;

        let url = self.build_url(&ctx);
        tracing::debug!(method = %ctx.method, %url, request_id, "executing request");

        let mut request = self
            .inner
            .http
            .request(ctx.method.clone(), url)
            .timeout(ctx.timeout)
            .headers(ctx.headers.clone());
        if let Some(body) = &ctx.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(ApiError::from_reqwest)?;

        let status = response.status();
        let headers = response.headers().clone();
        let raw_body = response.text().await.map_err(ApiError::from_reqwest)?;

        let rctx = self.inner.interceptors.apply_response(ResponseContext {
            status,
            headers,
            body: raw_body,
            error_body: None,
        })?;

        if !rctx.status.is_success() {
            let err = ApiError::from_response(rctx.status, &rctx.headers, rctx.error_body);
            if err.status == 401 {
                // Terminal 401: the stored token is dead.
                self.inner.auth.clear();
                if let Some(handler) = &self.inner.on_unauthorized {
                    handler();
                }
            }
            tracing::warn!(
                status = rctx.status.as_u16(),
                method = %ctx.method,
                endpoint,
                code = %err.code,
                "request failed"
            );
            return Err(err);
        }

        let response = if rctx.body.trim().is_empty() {
            ApiResponse::ok(None, None)
        } else {
            let value: serde_json::Value = serde_json::from_str(&rctx.body)
                .map_err(|e| ApiError::internal(format!("invalid json response: {e}")))?;
            ApiResponse::from_body(value)
        };

        Ok(NetOutcome {
            response,
            status: rctx.status.as_u16(),
        })
    }

    fn build_url(&self, ctx: &RequestContext) -> Url {
        let (path, query) = match ctx.endpoint.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (ctx.endpoint.as_str(), None),
        };

        let mut url = self.inner.config.base_url.clone();
        url.set_path(path);
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(query) = query {
                for pair in query.split('&').filter(|p| !p.is_empty()) {
                    let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                    pairs.append_pair(k, v);
                }
            }
            for (k, v) in &ctx.params {
                pairs.append_pair(k, v);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        url
    }

    fn enqueue_offline(
        &self,
        method: &Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<ApiResponse> {
        let id = self
            .inner
            .queue
            .enqueue(method, endpoint, body, options)
            .map_err(|e| ApiError::internal(e.to_string()))?;

        if !options.skip_logging {
            self.inner.log.record(
                LogEvent::new(LogKind::Queue, method.as_str(), endpoint)
                    .message(format!("queued as {id}")),
            );
        }

        // The link may have come back between the offline check and the
        // enqueue; drain in the background if so.
        if self.inner.connectivity.is_online() {
            let client = self.clone();
            tokio::spawn(async move {
                client.process_offline_queue().await;
            });
        }

        Ok(ApiResponse::queued(&id))
    }

    fn cache_plan(
        &self,
        method: &Method,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Option<CachePlan> {
        match &options.cache {
            CachePolicy::Disabled => None,
            CachePolicy::Default => {
                if *method != Method::GET {
                    return None;
                }
                Some(CachePlan {
                    key: build_cache_key(method, endpoint, &options.params, &[]),
                    ttl: ttl_for_endpoint(endpoint),
                    persistent: is_persistent_endpoint(endpoint),
                })
            }
            CachePolicy::Custom {
                ttl,
                key,
                skip_params,
                persistent,
            } => Some(CachePlan {
                key: key
                    .clone()
                    .unwrap_or_else(|| build_cache_key(method, endpoint, &options.params, skip_params)),
                ttl: (*ttl).unwrap_or_else(|| ttl_for_endpoint(endpoint)),
                persistent: (*persistent).unwrap_or_else(|| is_persistent_endpoint(endpoint)),
            }),
        }
    }

    /// GET convenience wrapper.
    pub async fn get(&self, endpoint: &str, options: RequestOptions) -> Result<ApiResponse> {
        self.request(Method::GET, endpoint, None, options).await
    }

    /// POST convenience wrapper with a JSON body.
    pub async fn post<B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::internal(format!("failed to serialize body: {e}")))?;
        self.request(Method::POST, endpoint, Some(body), options).await
    }

    pub async fn put<B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::internal(format!("failed to serialize body: {e}")))?;
        self.request(Method::PUT, endpoint, Some(body), options).await
    }

    pub async fn patch<B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::internal(format!("failed to serialize body: {e}")))?;
        self.request(Method::PATCH, endpoint, Some(body), options).await
    }

    pub async fn delete(&self, endpoint: &str, options: RequestOptions) -> Result<ApiResponse> {
        self.request(Method::DELETE, endpoint, None, options).await
    }

    /// Aborts every in-flight request. Callers observe a TIMEOUT-coded
    /// error. Already-queued offline entries are unaffected.
    pub fn cancel_all_requests(&self) {
        let mut in_flight = self.inner.in_flight.lock().expect("in-flight map poisoned");
        for (_, entry) in in_flight.drain() {
            entry.cancel.notify_one();
        }
    }

    /// Aborts in-flight requests whose endpoint matches the `*`-wildcard
    /// pattern.
    pub fn cancel_requests_for_endpoint(&self, pattern: &str) {
        let mut in_flight = self.inner.in_flight.lock().expect("in-flight map poisoned");
        in_flight.retain(|_, entry| {
            let matched =
                pattern_matches(pattern, &entry.endpoint) || entry.endpoint.starts_with(pattern);
            if matched {
                entry.cancel.notify_one();
            }
            !matched
        });
    }

    /// Replays the offline queue, strictly in enqueue order. A no-op while
    /// offline or when another processor is already draining.
    pub async fn process_offline_queue(&self) -> ProcessReport {
        if !self.inner.connectivity.is_online() {
            return ProcessReport {
                remaining: self.inner.queue.len(),
                ..Default::default()
            };
        }

        let client = self.clone();
        self.inner
            .queue
            .process(move |item: QueuedRequest| {
                let client = client.clone();
                // Boxed so the replay future does not recursively embed the
                // request future's type.
                let fut: Pin<Box<dyn Future<Output = Result<()>> + Send>> = Box::pin(async move {
                    let QueuedRequest {
                        method,
                        endpoint,
                        body,
                        skip_auth,
                        timeout_ms,
                        params,
                        headers,
                        ..
                    } = item;
                    let method = Method::from_bytes(method.as_bytes())
                        .map_err(|e| ApiError::internal(format!("invalid queued method: {e}")))?;
                    // The queue owns the per-entry retry budget; a nested
                    // engine retry would multiply it.
                    let mut options = RequestOptions::new().skip_queue().no_retry();
                    options.skip_auth = skip_auth;
                    options.timeout = timeout_ms.map(Duration::from_millis);
                    options.params = params;
                    for (name, value) in &headers {
                        options = options.header(name, value)?;
                    }
                    client.request(method, &endpoint, body, options).await?;
                    Ok(())
                });
                fut
            })
            .await
    }

    // Admin surface.

    /// Snapshot of the bounded request log.
    pub fn api_logs(&self) -> Vec<LogEvent> {
        self.inner.log.events()
    }

    /// The request log serialized as a JSON array.
    pub fn export_logs(&self) -> Result<String> {
        self.inner.log.export_json()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Evicts cache entries matching the `*`-wildcard pattern; returns the
    /// count evicted.
    pub fn invalidate_cache(&self, pattern: &str) -> usize {
        self.inner.cache.invalidate(pattern)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.inner.queue.status()
    }

    pub fn clear_offline_queue(&self) {
        self.inner.queue.clear();
    }

    /// Stores a bearer token under the fixed auth key (e.g. after login).
    pub fn store_auth_token(&self, token: &str) -> Result<()> {
        self.inner.auth.store(token)
    }

    pub fn clear_auth_token(&self) {
        self.inner.auth.clear();
    }

    /// The interceptor pipeline, for registering custom transforms.
    pub fn interceptors(&self) -> &InterceptorPipeline {
        &self.inner.interceptors
    }
}

/// Builder for [`ApiClient`].
///
/// ```no_run
/// use moorage::{ApiClient, BackoffPolicy};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), moorage::ApiError> {
/// let client = ApiClient::builder()
///     .base_url("https://api.example.com")?
///     .timeout(Duration::from_secs(10))
///     .debug(true)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    api_version: String,
    timeout: Duration,
    debug: bool,
    verbose: bool,
    storage: Option<Arc<dyn Storage>>,
    connectivity: Option<Arc<dyn Connectivity>>,
    backoff: BackoffPolicy,
    log_capacity: Option<usize>,
    on_token_expired: Option<RefreshFn>,
    on_unauthorized: Option<UnauthorizedHandler>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            api_version: "v1".to_string(),
            timeout: crate::config::DEFAULT_TIMEOUT,
            debug: false,
            verbose: false,
            storage: None,
            connectivity: None,
            backoff: BackoffPolicy::default(),
            log_capacity: None,
            on_token_expired: None,
            on_unauthorized: None,
        }
    }

    /// Seeds the builder from a pre-built [`ClientConfig`].
    pub fn from_config(config: ClientConfig) -> Self {
        let mut builder = Self::new();
        builder.base_url = Some(config.base_url);
        builder.api_version = config.api_version;
        builder.timeout = config.timeout;
        builder.debug = config.debug;
        builder.verbose = config.verbose;
        builder
    }

    /// Sets the base URL all endpoint paths resolve against. Required.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(
            Url::parse(url.as_ref())
                .map_err(|e| ApiError::internal(format!("invalid base url: {e}")))?,
        );
        Ok(self)
    }

    /// Sets the API version stamped into cache entries.
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Sets the default per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mirrors the request log to the console.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Includes request/response bodies in log events.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Sets the durable storage backing the auth token, persistent cache
    /// entries, and the offline queue. Defaults to in-memory.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the reachability signal. Defaults to always-online.
    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Sets the retry backoff policy.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the request-log ring capacity.
    pub fn log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = Some(capacity);
        self
    }

    /// Sets the refresh callback invoked when the stored token is within
    /// five minutes of expiry.
    pub fn on_token_expired<F, Fut>(mut self, refresh: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let wrapped: RefreshFn = Arc::new(move || Box::pin(refresh()));
        self.on_token_expired = Some(wrapped);
        self
    }

    /// Sets the handler invoked on a terminal 401, after the stored token
    /// has been cleared.
    pub fn on_unauthorized<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_unauthorized = Some(Arc::new(handler));
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL was set or the HTTP client cannot be
    /// constructed.
    pub fn build(self) -> Result<ApiClient> {
        let base_url = self
            .base_url
            .ok_or_else(|| ApiError::internal("base url is required"))?;

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ApiError::internal(format!("failed to build http client: {e}")))?;

        let config = ClientConfig {
            base_url,
            api_version: self.api_version,
            timeout: self.timeout,
            debug: self.debug,
            verbose: self.verbose,
        };

        let storage: Arc<dyn Storage> = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let connectivity: Arc<dyn Connectivity> =
            self.connectivity.unwrap_or_else(|| Arc::new(AlwaysOnline));

        let cache = ResponseCache::new(storage.clone(), config.api_version.clone());
        let queue = OfflineQueue::new(storage.clone());
        let auth = TokenStore::new(storage, self.on_token_expired);
        let log = match self.log_capacity {
            Some(capacity) => RequestLog::with_capacity(capacity, config.debug),
            None => RequestLog::new(config.debug),
        };

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                http,
                config,
                interceptors: InterceptorPipeline::with_defaults(),
                retry: RetryEngine::new(self.backoff),
                cache,
                queue,
                auth,
                log,
                connectivity,
                on_unauthorized: self.on_unauthorized,
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
