//! Construction-time configuration.
//!
//! Read once when the client is built; there is no hot reload.

use crate::error::{ApiError, Result};
use std::time::Duration;
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Single-origin base URL every endpoint path is resolved against.
    pub base_url: Url,
    /// API version stamped into cache entries; a bump invalidates them all.
    pub api_version: String,
    /// Default per-request timeout.
    pub timeout: Duration,
    /// Mirror the request log to the console (tracing).
    pub debug: bool,
    /// Include request/response bodies in log events.
    pub verbose: bool,
}

impl ClientConfig {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())
            .map_err(|e| ApiError::internal(format!("invalid base url: {e}")))?;
        Ok(Self {
            base_url,
            api_version: "v1".to_string(),
            timeout: DEFAULT_TIMEOUT,
            debug: false,
            verbose: false,
        })
    }

    /// Reads configuration from `MOORAGE_API_URL`, `MOORAGE_API_VERSION`,
    /// `MOORAGE_DEBUG`, and `MOORAGE_VERBOSE`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("MOORAGE_API_URL")
            .map_err(|_| ApiError::internal("MOORAGE_API_URL is not set"))?;
        let mut config = Self::new(base_url)?;
        if let Ok(version) = std::env::var("MOORAGE_API_VERSION") {
            config.api_version = version;
        }
        config.debug = env_flag("MOORAGE_DEBUG");
        config.verbose = env_flag("MOORAGE_VERBOSE");
        Ok(config)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
