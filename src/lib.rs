//! Resilient JSON API client for the Moorage escrow backend.
//!
//! Every call goes through one pipeline: auth-token resolution, ordered
//! interceptors, jittered exponential retries, TTL response caching with
//! rule-based invalidation, and a durable offline queue for mutations made
//! while unreachable. Failures of every kind normalize into a single
//! [`ApiError`] carrying a machine-readable [`ErrorCode`].
//!
//! # Getting started
//!
//! ```no_run
//! use moorage::{ApiClient, RequestOptions};
//!
//! # async fn example() -> Result<(), moorage::ApiError> {
//! let client = ApiClient::builder()
//!     .base_url("https://api.example.com")?
//!     .build()?;
//!
//! let profile = client.get("/user/profile", RequestOptions::new()).await?;
//! println!("{:?}", profile.data);
//! # Ok(())
//! # }
//! ```
//!
//! # Offline behavior
//!
//! With a [`Connectivity`] signal wired in, mutating calls made while offline
//! are queued durably and acknowledged with a queue id instead of failing.
//! Call [`ApiClient::process_offline_queue`] when the link returns to replay
//! them in order.
//!
//! # Durability
//!
//! The auth token, persistent cache entries, and the offline queue live
//! behind the [`Storage`] trait. The default is in-memory; use
//! [`FileStorage`] (or a custom implementation) to survive restarts.

mod auth;
mod cache;
mod client;
mod config;
mod connectivity;
mod error;
mod interceptor;
mod logger;
mod queue;
mod request;
mod retry;
mod storage;

pub use auth::{decode_claims, RefreshFn, TokenClaims, AUTH_TOKEN_KEY};
pub use cache::{
    build_cache_key, is_persistent_endpoint, ttl_for_endpoint, CacheStats, LONG_TTL, MEDIUM_TTL,
    SHORT_TTL,
};
pub use client::{ApiClient, ClientBuilder};
pub use config::{ClientConfig, DEFAULT_TIMEOUT};
pub use connectivity::{AlwaysOnline, Connectivity, SharedConnectivity};
pub use error::{ApiError, ErrorBody, ErrorCode, Result};
pub use interceptor::{
    InterceptorHandle, InterceptorPipeline, RequestContext, ResponseContext,
};
pub use logger::{LogEvent, LogKind};
pub use queue::{ProcessReport, QueueStatus, QueuedRequest, MAX_QUEUE_SIZE};
pub use request::{is_mutating, ApiResponse, CachePolicy, RequestOptions};
pub use retry::{BackoffPolicy, RetryEngine};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
