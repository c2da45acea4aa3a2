//! Durable client-side key/value storage.
//!
//! The auth token, persistent cache entries, and the offline queue all live
//! behind the [`Storage`] trait so tests can run against an in-memory store
//! and embedders can plug in whatever the host platform provides. Writes are
//! last-write-wins; the client is cooperative single-flight per key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Storage failures. Quota exhaustion is recoverable by design: callers
/// degrade (drop persistence, truncate) rather than crash.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Process-wide durable string store.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str);
    /// All currently stored keys, unordered.
    fn keys(&self) -> Vec<String>;
}

/// In-memory store, optionally quota-limited.
///
/// The quota counts the total bytes of keys plus values, which is enough to
/// exercise the quota-degradation paths in the cache and the offline queue.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().expect("storage poisoned").get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().expect("storage poisoned");
        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(StorageError::QuotaExceeded);
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.entries.lock().expect("storage poisoned").remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("storage poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// File-backed store: one JSON object per store, loaded at open and written
/// through on every mutation.
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        let raw = serde_json::to_string(entries)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().expect("storage poisoned").get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().expect("storage poisoned");
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().expect("storage poisoned");
        if entries.remove(key).is_some() {
            if let Err(e) = self.flush(&entries) {
                tracing::warn!(error = %e, "failed to flush storage after remove");
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("storage poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
