//! Ordered request/response transform pipeline.
//!
//! Interceptors run strictly in registration order; each receives the
//! previous step's output. Registration returns a handle that removes exactly
//! that interceptor. The defaults the client relies on (JSON content type,
//! request-id stamp, bearer injection, error-body pre-parse) are registered
//! first by [`InterceptorPipeline::with_defaults`].

use crate::error::{ApiError, ErrorBody, Result};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// The mutable view of a request that interceptors transform.
///
/// Built fresh for every attempt; the caller's `RequestOptions` stay
/// untouched.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub endpoint: String,
    pub headers: HeaderMap,
    pub params: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
    /// Unique id for tracing and cancellation bookkeeping.
    pub request_id: String,
    /// Bearer token resolved by the client's token store, absent when
    /// `skip_auth` was set or no usable token exists.
    pub auth_token: Option<String>,
}

/// The raw response view interceptors transform. The body is fully buffered
/// before interceptors run.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
    /// Pre-parsed error body for non-2xx responses, attached by the built-in
    /// response interceptor so the client need not re-parse.
    pub error_body: Option<ErrorBody>,
}

pub type RequestInterceptor = Box<dyn Fn(RequestContext) -> Result<RequestContext> + Send + Sync>;
pub type ResponseInterceptor =
    Box<dyn Fn(ResponseContext) -> Result<ResponseContext> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Request,
    Response,
}

/// Removal handle returned at registration.
#[derive(Debug, Clone, Copy)]
pub struct InterceptorHandle {
    id: u64,
    kind: Kind,
}

struct Entry<F> {
    id: u64,
    name: String,
    func: F,
}

/// Ordered, mutable interceptor chains.
pub struct InterceptorPipeline {
    request: Mutex<Vec<Entry<RequestInterceptor>>>,
    response: Mutex<Vec<Entry<ResponseInterceptor>>>,
    next_id: AtomicU64,
}

impl InterceptorPipeline {
    /// An empty pipeline, for tests that want full control.
    pub fn empty() -> Self {
        Self {
            request: Mutex::new(Vec::new()),
            response: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// A pipeline with the built-in defaults registered first.
    pub fn with_defaults() -> Self {
        let pipeline = Self::empty();

        pipeline.add_request("json-content-type", |mut ctx: RequestContext| {
            if ctx.body.is_some() && !ctx.headers.contains_key(CONTENT_TYPE) {
                ctx.headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            Ok(ctx)
        });

        pipeline.add_request("request-id", |mut ctx: RequestContext| {
            let value = HeaderValue::from_str(&ctx.request_id)
                .map_err(|e| ApiError::internal(format!("invalid request id: {e}")))?;
            ctx.headers.insert("x-request-id", value);
            Ok(ctx)
        });

        pipeline.add_request("bearer-auth", |mut ctx: RequestContext| {
            if let Some(token) = &ctx.auth_token {
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| ApiError::internal(format!("invalid auth token: {e}")))?;
                ctx.headers.insert(AUTHORIZATION, value);
            }
            Ok(ctx)
        });

        pipeline.add_response("error-body", |mut ctx: ResponseContext| {
            if !ctx.status.is_success() && ctx.error_body.is_none() {
                ctx.error_body = serde_json::from_str(&ctx.body).ok();
            }
            Ok(ctx)
        });

        pipeline
    }

    /// Registers a request interceptor at the end of the chain.
    pub fn add_request<F>(&self, name: impl Into<String>, func: F) -> InterceptorHandle
    where
        F: Fn(RequestContext) -> Result<RequestContext> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.request.lock().expect("pipeline poisoned").push(Entry {
            id,
            name: name.into(),
            func: Box::new(func),
        });
        InterceptorHandle {
            id,
            kind: Kind::Request,
        }
    }

    /// Registers a response interceptor at the end of the chain.
    pub fn add_response<F>(&self, name: impl Into<String>, func: F) -> InterceptorHandle
    where
        F: Fn(ResponseContext) -> Result<ResponseContext> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.response
            .lock()
            .expect("pipeline poisoned")
            .push(Entry {
                id,
                name: name.into(),
                func: Box::new(func),
            });
        InterceptorHandle {
            id,
            kind: Kind::Response,
        }
    }

    /// Removes the single interceptor the handle refers to. Returns `false`
    /// if it was already removed.
    pub fn remove(&self, handle: InterceptorHandle) -> bool {
        match handle.kind {
            Kind::Request => {
                let mut chain = self.request.lock().expect("pipeline poisoned");
                let before = chain.len();
                chain.retain(|e| e.id != handle.id);
                chain.len() != before
            }
            Kind::Response => {
                let mut chain = self.response.lock().expect("pipeline poisoned");
                let before = chain.len();
                chain.retain(|e| e.id != handle.id);
                chain.len() != before
            }
        }
    }

    /// Folds the request through the chain in registration order.
    pub fn apply_request(&self, mut ctx: RequestContext) -> Result<RequestContext> {
        let chain = self.request.lock().expect("pipeline poisoned");
        for entry in chain.iter() {
            ctx = (entry.func)(ctx).map_err(|mut e| {
                e.message = format!("request interceptor '{}': {}", entry.name, e.message);
                e
            })?;
        }
        Ok(ctx)
    }

    /// Folds the response through the chain in registration order.
    pub fn apply_response(&self, mut ctx: ResponseContext) -> Result<ResponseContext> {
        let chain = self.response.lock().expect("pipeline poisoned");
        for entry in chain.iter() {
            ctx = (entry.func)(ctx).map_err(|mut e| {
                e.message = format!("response interceptor '{}': {}", entry.name, e.message);
                e
            })?;
        }
        Ok(ctx)
    }
}
