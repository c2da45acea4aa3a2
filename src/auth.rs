//! Auth-token lifecycle.
//!
//! The bearer token is a three-part dot-separated string persisted under a
//! fixed storage key. Before every authenticated call the client asks
//! [`TokenStore::bearer`] for a token: structurally invalid or expired tokens
//! are removed and the call continues unauthenticated; tokens within five
//! minutes of expiry are refreshed through the injected callback first.
//!
//! Signature verification is the backend's job; the client only decodes the
//! payload to read the expiry claim.

use crate::error::{ApiError, Result};
use crate::storage::Storage;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed durable-storage key for the token. Consumers never touch it
/// directly.
pub const AUTH_TOKEN_KEY: &str = "auth_token";

/// Refresh when less than this many seconds remain on the token.
const REFRESH_WINDOW_SECS: u64 = 300;

/// Async callback that produces a fresh token when the stored one is near
/// expiry.
pub type RefreshFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync>;

/// Decoded token payload. Only the expiry claim matters to the client.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    /// Expiry, unix seconds.
    pub exp: u64,
    #[serde(default)]
    pub sub: Option<String>,
}

/// Decodes the payload segment of a three-part token.
pub fn decode_claims(token: &str) -> Result<TokenClaims> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(ApiError::internal("malformed auth token: expected 3 parts"));
    }
    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| ApiError::internal(format!("malformed auth token payload: {e}")))?;
    serde_json::from_slice(&payload)
        .map_err(|e| ApiError::internal(format!("undecodable auth token claims: {e}")))
}

/// Token storage plus the refresh capability, injected at client build time.
#[derive(Clone)]
pub struct TokenStore {
    storage: Arc<dyn Storage>,
    on_token_expired: Option<RefreshFn>,
}

impl TokenStore {
    pub fn new(storage: Arc<dyn Storage>, on_token_expired: Option<RefreshFn>) -> Self {
        Self {
            storage,
            on_token_expired,
        }
    }

    /// Resolves the token to attach to a request.
    ///
    /// Returns `Ok(None)` when no usable token exists: the request proceeds
    /// unauthenticated rather than failing locally. Invalid and expired
    /// tokens are removed from storage as a side effect.
    pub async fn bearer(&self) -> Result<Option<String>> {
        let Some(token) = self.storage.get(AUTH_TOKEN_KEY) else {
            return Ok(None);
        };

        let claims = match decode_claims(&token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!(error = %e, "removing invalid auth token");
                self.clear();
                return Ok(None);
            }
        };

        let now = unix_now();
        if claims.exp > now + REFRESH_WINDOW_SECS {
            return Ok(Some(token));
        }

        // Near or past expiry: try the refresh callback first.
        if let Some(refresh) = &self.on_token_expired {
            match refresh().await {
                Ok(fresh) => {
                    self.store(&fresh)?;
                    return Ok(Some(fresh));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "token refresh failed");
                }
            }
        }

        if claims.exp <= now {
            tracing::debug!("removing expired auth token");
            self.clear();
            return Ok(None);
        }

        // Inside the refresh window but still valid; use it as-is.
        Ok(Some(token))
    }

    /// Persists a token under the fixed key.
    pub fn store(&self, token: &str) -> Result<()> {
        self.storage
            .set(AUTH_TOKEN_KEY, token)
            .map_err(|e| ApiError::internal(format!("failed to store auth token: {e}")))
    }

    /// Removes the stored token (invalid token or terminal 401).
    pub fn clear(&self) {
        self.storage.remove(AUTH_TOKEN_KEY);
    }

    /// The raw stored token, without validation.
    pub fn stored(&self) -> Option<String> {
        self.storage.get(AUTH_TOKEN_KEY)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
