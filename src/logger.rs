//! Bounded in-memory log of request/response/error events.
//!
//! The ring keeps the most recent events (default 100) so a support export
//! can show what the client did without unbounded growth. When the debug
//! flag is set, every event is mirrored to `tracing`.

use crate::error::{now_ms, ApiError, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

const DEFAULT_CAPACITY: usize = 100;

/// What a [`LogEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Request,
    Response,
    Error,
    Retry,
    CacheHit,
    Queue,
}

/// One entry in the request log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub timestamp_ms: u64,
    pub kind: LogKind,
    pub method: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Request/response body snapshot; only populated in verbose mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl LogEvent {
    pub fn new(kind: LogKind, method: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            timestamp_ms: now_ms(),
            kind,
            method: method.into(),
            endpoint: endpoint.into(),
            status: None,
            duration_ms: None,
            message: None,
            body: None,
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Append-only bounded ring of [`LogEvent`]s.
pub struct RequestLog {
    events: Mutex<VecDeque<LogEvent>>,
    capacity: usize,
    mirror: bool,
}

impl RequestLog {
    /// A log with the default capacity. `mirror` enables the console mirror
    /// through `tracing`.
    pub fn new(mirror: bool) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, mirror)
    }

    pub fn with_capacity(capacity: usize, mirror: bool) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            mirror,
        }
    }

    /// Appends an event, evicting the oldest entry once full.
    pub fn record(&self, event: LogEvent) {
        if self.mirror {
            tracing::debug!(
                kind = ?event.kind,
                method = %event.method,
                endpoint = %event.endpoint,
                status = event.status,
                duration_ms = event.duration_ms,
                message = event.message.as_deref().unwrap_or(""),
                "api log"
            );
        }
        let mut events = self.events.lock().expect("log poisoned");
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// A snapshot of the buffered events, oldest first.
    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .expect("log poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Serializes the buffered events to a JSON array.
    pub fn export_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.events())
            .map_err(|e| ApiError::internal(format!("log export failed: {e}")))
    }

    pub fn clear(&self) {
        self.events.lock().expect("log poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let log = RequestLog::with_capacity(3, false);
        for i in 0..5 {
            log.record(LogEvent::new(LogKind::Request, "GET", format!("/e/{i}")));
        }
        let events = log.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].endpoint, "/e/2");
        assert_eq!(events[2].endpoint, "/e/4");
    }

    #[test]
    fn export_is_json_array() {
        let log = RequestLog::new(false);
        log.record(
            LogEvent::new(LogKind::Response, "GET", "/wallet")
                .status(200)
                .duration_ms(12),
        );
        let json = log.export_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);
        assert_eq!(parsed[0]["status"], 200);
        assert_eq!(parsed[0]["kind"], "response");
    }
}
