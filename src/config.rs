//! Configuration for the state manager and the session tracker.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::storage::StorageArea;

/// Storage key the manager persists to unless told otherwise.
pub const DEFAULT_STORAGE_KEY: &str = "app-state-manager";

/// Default time between garbage collection sweeps.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Default upper bound on entries kept after a sweep.
pub const DEFAULT_MAX_STATES: usize = 1000;

/// Default buffer of the update stream channel.
pub const DEFAULT_UPDATE_CHANNEL_CAPACITY: usize = 256;

/// State manager settings.
///
/// Deserializable so an application can load it from its own config file;
/// durations are given in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerConfig {
    /// Key the snapshot is written under.
    pub storage_key: String,
    /// Persist on every mutation and hydrate on construction.
    pub persist: bool,
    /// Area the snapshot lives in.
    pub storage_area: StorageArea,
    /// Time between sweeps; `None` disables the background timer.
    #[serde(with = "opt_millis")]
    pub gc_interval: Option<Duration>,
    /// Entries beyond this are evicted oldest-first by each sweep.
    pub max_states: usize,
    pub update_channel_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            persist: false,
            storage_area: StorageArea::Local,
            gc_interval: Some(DEFAULT_GC_INTERVAL),
            max_states: DEFAULT_MAX_STATES,
            update_channel_capacity: DEFAULT_UPDATE_CHANNEL_CAPACITY,
        }
    }
}

impl ManagerConfig {
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn with_persistence(mut self, area: StorageArea) -> Self {
        self.persist = true;
        self.storage_area = area;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = Some(interval);
        self
    }

    pub fn without_gc_timer(mut self) -> Self {
        self.gc_interval = None;
        self
    }

    pub fn with_max_states(mut self, max: usize) -> Self {
        self.max_states = max;
        self
    }

    pub fn with_update_channel_capacity(mut self, capacity: usize) -> Self {
        self.update_channel_capacity = capacity;
        self
    }
}

/// Session tracker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Refresh once less than this remains before token expiry.
    #[serde(with = "millis")]
    pub refresh_threshold: Duration,
    /// Minimum spacing between recorded activity writes.
    #[serde(with = "millis")]
    pub activity_throttle: Duration,
    /// Prefix of every key the tracker owns.
    pub key_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(300),
            activity_throttle: Duration::from_secs(1),
            key_prefix: "auth/".to_string(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => serializer.serialize_u64(d.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.storage_key, "app-state-manager");
        assert!(!config.persist);
        assert_eq!(config.gc_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.max_states, 1000);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let text = r#"{"persist": true, "gcInterval": 5000, "storageArea": "session"}"#;
        let config: ManagerConfig = serde_json::from_str(text).unwrap();
        assert!(config.persist);
        assert_eq!(config.gc_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.storage_area, StorageArea::Session);
        assert_eq!(config.max_states, DEFAULT_MAX_STATES);
    }

    #[test]
    fn test_null_gc_interval_disables_timer() {
        let config: ManagerConfig = serde_json::from_str(r#"{"gcInterval": null}"#).unwrap();
        assert_eq!(config.gc_interval, None);
    }

    #[test]
    fn test_builder() {
        let config = ManagerConfig::default()
            .with_storage_key("console")
            .with_persistence(StorageArea::Session)
            .with_max_states(3)
            .without_gc_timer();
        assert_eq!(config.storage_key, "console");
        assert!(config.persist);
        assert_eq!(config.max_states, 3);
        assert!(config.gc_interval.is_none());
    }

    #[test]
    fn test_session_config_json() {
        let config: SessionConfig = serde_json::from_str(r#"{"refreshThreshold": 60000}"#).unwrap();
        assert_eq!(config.refresh_threshold, Duration::from_secs(60));
        assert_eq!(config.key_prefix, "auth/");
    }
}
