//! Durable offline queue for mutating requests.
//!
//! Mutating calls made while the network is unreachable are enqueued here and
//! replayed strictly in order when connectivity returns. The full queue is
//! written through to durable storage on every mutation; entries older than
//! 24 hours are purged on load. Capacity overflow is a hard failure: the
//! caller is told, nothing is silently dropped. Durability itself is
//! best-effort: on quota exhaustion the stored copy is truncated to the
//! newest half, then dropped entirely.

use crate::error::now_ms;
use crate::request::RequestOptions;
use crate::storage::{Storage, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const QUEUE_STORAGE_KEY: &str = "offline_queue";
/// Hard capacity; enqueueing past it fails loudly.
pub const MAX_QUEUE_SIZE: usize = 50;
/// Replay attempts per entry before it is permanently dropped.
pub const MAX_REPLAY_RETRIES: u32 = 3;
/// Entries older than this are discarded on load.
const MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;
/// Linear backoff unit between replay attempts of the same entry.
const REPLAY_BACKOFF_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("offline queue is full ({0} entries)")]
    Full(usize),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A deferred mutating request plus the option snapshot needed to replay it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: String,
    pub method: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub skip_auth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Query params the caller attached; replay must hit the same URL.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// Custom headers, as strings. Non-UTF-8 header values are not queued.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub enqueued_at_ms: u64,
    pub retry_count: u32,
}

/// Snapshot surfaced through the queue admin interface.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub length: usize,
    pub processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_enqueued_at_ms: Option<u64>,
}

/// Outcome of one [`OfflineQueue::process`] run.
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    pub replayed: usize,
    pub dropped: usize,
    pub remaining: usize,
    /// True when another processor already held the replay lock.
    pub already_running: bool,
}

/// Durable FIFO of deferred mutations.
pub struct OfflineQueue {
    items: Mutex<VecDeque<QueuedRequest>>,
    storage: Arc<dyn Storage>,
    // Single-flight replay guard; FIFO ordering depends on it.
    processing: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    /// Loads the queue from storage, purging entries older than 24 hours.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let mut items: VecDeque<QueuedRequest> = storage
            .get(QUEUE_STORAGE_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        let cutoff = now_ms().saturating_sub(MAX_AGE_MS);
        let before = items.len();
        items.retain(|item| item.enqueued_at_ms >= cutoff);

        let queue = Self {
            items: Mutex::new(items),
            storage,
            processing: tokio::sync::Mutex::new(()),
        };
        if before != queue.len() {
            tracing::info!(purged = before - queue.len(), "purged stale offline queue entries");
            let mut items = queue.items.lock().expect("queue poisoned");
            queue.persist(&mut items);
        }
        queue
    }

    /// Appends a request, snapshotting the options needed to replay it
    /// faithfully. Fails with [`QueueError::Full`] at capacity.
    pub fn enqueue(
        &self,
        method: &http::Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<String, QueueError> {
        let mut items = self.items.lock().expect("queue poisoned");
        if items.len() >= MAX_QUEUE_SIZE {
            return Err(QueueError::Full(items.len()));
        }

        let headers = options
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let item = QueuedRequest {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            body,
            skip_auth: options.skip_auth,
            timeout_ms: options.timeout.map(|t| t.as_millis() as u64),
            params: options.params.clone(),
            headers,
            enqueued_at_ms: now_ms(),
            retry_count: 0,
        };
        let id = item.id.clone();
        tracing::info!(id = %id, method = %item.method, endpoint, "queued request for offline replay");
        items.push_back(item);
        self.persist(&mut items);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.items.lock().expect("queue poisoned").clear();
        self.storage.remove(QUEUE_STORAGE_KEY);
    }

    pub fn snapshot(&self) -> Vec<QueuedRequest> {
        self.items
            .lock()
            .expect("queue poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn status(&self) -> QueueStatus {
        let items = self.items.lock().expect("queue poisoned");
        QueueStatus {
            length: items.len(),
            processing: self.processing.try_lock().is_err(),
            oldest_enqueued_at_ms: items.front().map(|i| i.enqueued_at_ms),
        }
    }

    /// Replays the queue strictly in order, one request in flight at a time.
    ///
    /// A successful replay removes the entry. A failed replay increments its
    /// retry count and, while under the budget, requeues it at the tail after
    /// a linear `1000ms x retry_count` delay; past the budget it is dropped
    /// with an error log. Re-entrant calls bail out immediately so only one
    /// processor ever runs.
    pub async fn process<F, Fut>(&self, mut replay: F) -> ProcessReport
    where
        F: FnMut(QueuedRequest) -> Fut,
        Fut: Future<Output = crate::error::Result<()>>,
    {
        let Ok(_guard) = self.processing.try_lock() else {
            return ProcessReport {
                remaining: self.len(),
                already_running: true,
                ..Default::default()
            };
        };

        let mut report = ProcessReport::default();
        loop {
            let Some(item) = self
                .items
                .lock()
                .expect("queue poisoned")
                .front()
                .cloned()
            else {
                break;
            };

            let outcome = replay(item.clone()).await;

            // The front is only ever consumed here; pop by id in case the
            // queue was cleared underneath us.
            {
                let mut items = self.items.lock().expect("queue poisoned");
                if items.front().map(|f| f.id == item.id).unwrap_or(false) {
                    items.pop_front();
                }
                self.persist(&mut items);
            }

            match outcome {
                Ok(()) => {
                    tracing::info!(id = %item.id, endpoint = %item.endpoint, "replayed queued request");
                    report.replayed += 1;
                }
                Err(e) => {
                    let mut retry = item;
                    retry.retry_count += 1;
                    if retry.retry_count < MAX_REPLAY_RETRIES {
                        tracing::warn!(
                            id = %retry.id,
                            endpoint = %retry.endpoint,
                            retry_count = retry.retry_count,
                            error = %e,
                            "queued request replay failed, requeueing"
                        );
                        tokio::time::sleep(Duration::from_millis(
                            REPLAY_BACKOFF_MS * retry.retry_count as u64,
                        ))
                        .await;
                        let mut items = self.items.lock().expect("queue poisoned");
                        items.push_back(retry);
                        self.persist(&mut items);
                    } else {
                        tracing::error!(
                            id = %retry.id,
                            endpoint = %retry.endpoint,
                            error = %e,
                            "dropping queued request after exhausting replay retries"
                        );
                        report.dropped += 1;
                    }
                }
            }
        }

        report.remaining = self.len();
        report
    }

    /// Writes the queue through to storage. Quota exhaustion truncates the
    /// queue to its newest half; if even that cannot be stored, the durable
    /// copy is dropped and the queue continues in memory.
    fn persist(&self, items: &mut VecDeque<QueuedRequest>) {
        if items.is_empty() {
            self.storage.remove(QUEUE_STORAGE_KEY);
            return;
        }

        match self.try_store(items) {
            Ok(()) => {}
            Err(StorageError::QuotaExceeded) => {
                let keep = items.len().div_ceil(2);
                let drop_count = items.len() - keep;
                if drop_count > 0 {
                    tracing::warn!(
                        dropped = drop_count,
                        "storage quota exceeded, truncating offline queue to newest half"
                    );
                    items.drain(..drop_count);
                }
                if let Err(e) = self.try_store(items) {
                    tracing::error!(error = %e, "cannot persist offline queue, continuing in memory only");
                    self.storage.remove(QUEUE_STORAGE_KEY);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to persist offline queue");
            }
        }
    }

    fn try_store(&self, items: &VecDeque<QueuedRequest>) -> Result<(), StorageError> {
        let raw = serde_json::to_string(&items.iter().collect::<Vec<_>>())
            .map_err(StorageError::from)?;
        self.storage.set(QUEUE_STORAGE_KEY, &raw)
    }
}
