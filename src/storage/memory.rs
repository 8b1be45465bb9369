//! In-memory storage backend.
//!
//! Not durable: contents are lost on process exit. Backs the session area
//! and tests. An optional byte quota mimics a browser storage limit.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{StorageBackend, StorageBus};
use crate::error::StorageError;

/// In-memory implementation of [`StorageBackend`].
///
/// Uses a BTreeMap for ordered key iteration and RwLock for concurrency.
pub struct MemoryBackend {
    data: RwLock<BTreeMap<String, String>>,
    quota: Option<usize>,
    bus: StorageBus,
}

impl MemoryBackend {
    /// Create an empty, unbounded backend.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            quota: None,
            bus: StorageBus::default(),
        }
    }

    /// Create an empty backend holding at most `bytes` of keys and values.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            quota: Some(bytes),
            ..Self::new()
        }
    }

    /// Get the number of items.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the backend is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Bytes currently used by keys and values.
    pub fn used_bytes(&self) -> usize {
        self.data
            .read()
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<Option<String>, StorageError> {
        let mut data = self.data.write();

        if let Some(quota) = self.quota {
            let replaced = data.get(key).map(|old| key.len() + old.len()).unwrap_or(0);
            let used: usize = data.iter().map(|(k, v)| k.len() + v.len()).sum();
            let requested = key.len() + value.len();
            if used - replaced + requested > quota {
                return Err(StorageError::QuotaExceeded {
                    quota,
                    used,
                    requested,
                });
            }
        }

        Ok(data.insert(key.to_string(), value.to_string()))
    }

    fn remove_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.write().remove(key))
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.data.write().clear();
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.data.read().keys().cloned().collect())
    }

    fn bus(&self) -> &StorageBus {
        &self.bus
    }
}
