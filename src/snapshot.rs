//! Persisted form of the manager's state.
//!
//! ```json
//! { "state": [["user", {"id": 1}]],
//!   "metadata": [["user", {"lastUpdated": 1700000000000, "version": 1}]] }
//! ```
//!
//! Pairs keep the blob readable by the web console, which stores its maps as
//! entry arrays.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

/// Per-key bookkeeping kept alongside every value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// Last successful write, in Unix milliseconds.
    pub last_updated: u64,
    /// Starts at 1, bumped by every value-changing `set`.
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "ttl_millis"
    )]
    pub ttl: Option<Duration>,
}

impl EntryMetadata {
    /// Whether the entry's TTL has elapsed at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_sub(self.last_updated) > ttl.as_millis() as u64,
            None => false,
        }
    }
}

/// Serialized state: entry pairs for values and metadata.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub state: Vec<(String, Value)>,
    #[serde(default)]
    pub metadata: Vec<(String, EntryMetadata)>,
}

impl Snapshot {
    /// Capture both maps, sorted by key so output is stable.
    pub fn capture(
        values: &HashMap<String, Value>,
        metadata: &HashMap<String, EntryMetadata>,
    ) -> Self {
        let mut state: Vec<_> = values.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut metadata: Vec<_> = metadata
            .iter()
            .map(|(k, m)| (k.clone(), m.clone()))
            .collect();
        state.sort_by(|a, b| a.0.cmp(&b.0));
        metadata.sort_by(|a, b| a.0.cmp(&b.0));
        Self { state, metadata }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Rebuild the two maps, keeping only keys present in both halves and
    /// not yet expired at `now`.
    pub fn restore(self, now: u64) -> (HashMap<String, Value>, HashMap<String, EntryMetadata>) {
        let mut metadata: HashMap<String, EntryMetadata> = self.metadata.into_iter().collect();
        let mut values = HashMap::with_capacity(self.state.len());

        for (key, value) in self.state {
            if metadata.get(&key).is_some_and(|m| !m.is_expired(now)) {
                values.insert(key, value);
            }
        }
        metadata.retain(|key, _| values.contains_key(key));
        (values, metadata)
    }
}

mod ttl_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        ttl: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match ttl {
            Some(ttl) => serializer.serialize_u64(ttl.as_millis() as u64),
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
    use serde_json::json;

    fn meta(last_updated: u64, version: u64, ttl: Option<u64>) -> EntryMetadata {
        EntryMetadata {
            last_updated,
            version,
            source: None,
            ttl: ttl.map(Duration::from_millis),
        }
    }

    #[test]
    fn test_is_expired_uses_strict_comparison() {
        let m = meta(1_000, 1, Some(100));
        assert!(!m.is_expired(1_050));
        assert!(!m.is_expired(1_100));
        assert!(m.is_expired(1_101));
        assert!(!meta(0, 1, None).is_expired(u64::MAX));
    }

    #[test]
    fn test_wire_format() {
        let mut values = HashMap::new();
        values.insert("user".to_string(), json!({"id": 1}));
        let mut metadata = HashMap::new();
        metadata.insert(
            "user".to_string(),
            EntryMetadata {
                last_updated: 5,
                version: 2,
                source: Some("login".to_string()),
                ttl: Some(Duration::from_millis(100)),
            },
        );

        let text = Snapshot::capture(&values, &metadata).to_json().unwrap();
        let json: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            json,
            json!({
                "state": [["user", {"id": 1}]],
                "metadata": [[
                    "user",
                    {"lastUpdated": 5, "version": 2, "source": "login", "ttl": 100}
                ]]
            })
        );
    }

    #[test]
    fn test_optional_fields_omitted() {
        let json = serde_json::to_value(meta(1, 1, None)).unwrap();
        assert_eq!(json, json!({"lastUpdated": 1, "version": 1}));
    }

    #[test]
    fn test_restore_drops_expired_and_orphaned_entries() {
        let snapshot = Snapshot {
            state: vec![
                ("live".to_string(), json!(1)),
                ("stale".to_string(), json!(2)),
                ("orphan".to_string(), json!(3)),
            ],
            metadata: vec![
                ("live".to_string(), meta(900, 1, None)),
                ("stale".to_string(), meta(100, 1, Some(10))),
                ("ghost".to_string(), meta(900, 1, None)),
            ],
        };

        let (values, metadata) = snapshot.restore(1_000);
        assert_eq!(values.len(), 1);
        assert_eq!(values["live"], json!(1));
        assert_eq!(metadata.keys().collect::<Vec<_>>(), vec!["live"]);
    }

    #[test]
    fn test_corrupt_json_is_an_error() {
        assert!(Snapshot::from_json("{\"state\": 5}").is_err());
        assert!(Snapshot::from_json("not json").is_err());
        assert_eq!(Snapshot::from_json("{}").unwrap(), Snapshot::default());
    }
}
