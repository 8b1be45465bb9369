//! Storage service: local and session storage areas with TTL-wrapped items.
//!
//! Items written through [`StorageService::set`] are stored as
//! `{"value": ..., "expiresAt": <ms> | null}` JSON text. Expired items are
//! removed on read. This TTL is independent of the state manager's own TTL.
//!
//! Every mutation is published on the backend's [`StorageBus`]. Services
//! sharing a backend therefore see each other's writes, which is how the
//! cross-tab `storage` event is modelled.

mod memory;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StateError, StorageError};

/// Capacity of each backend's change channel.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

/// Which storage area an item lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    /// Durable storage that survives restarts.
    #[default]
    Local,
    /// Storage scoped to the running process.
    Session,
}

/// Options for [`StorageService::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageOptions {
    pub area: StorageArea,
    pub ttl: Option<Duration>,
}

impl StorageOptions {
    pub fn area(area: StorageArea) -> Self {
        Self { area, ttl: None }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A change to a storage area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Changed key, or `None` when the whole area was cleared.
    pub key: Option<String>,
    pub area: StorageArea,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// Identifies the service instance that made the change.
    pub origin: u64,
}

/// Change channel shared by every service attached to one backend.
#[derive(Clone)]
pub struct StorageBus {
    sender: broadcast::Sender<StorageEvent>,
}

impl StorageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: StorageEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }
}

impl Default for StorageBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// Raw string key/value storage behind one area.
pub trait StorageBackend: Send + Sync {
    fn get_item(&self, key: &str) -> std::result::Result<Option<String>, StorageError>;

    /// Store `value`, returning the previous value.
    fn set_item(&self, key: &str, value: &str) -> std::result::Result<Option<String>, StorageError>;

    /// Remove `key`, returning the previous value.
    fn remove_item(&self, key: &str) -> std::result::Result<Option<String>, StorageError>;

    fn clear(&self) -> std::result::Result<(), StorageError>;

    /// All keys in lexicographic order.
    fn keys(&self) -> std::result::Result<Vec<String>, StorageError>;

    fn bus(&self) -> &StorageBus;
}

/// Item envelope carrying the storage-level TTL.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredItem {
    value: Value,
    expires_at: Option<u64>,
}

type Listener = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_key: HashMap<String, Vec<(u64, Listener)>>,
}

/// Handle returned by [`StorageService::subscribe`].
pub struct ListenerHandle {
    key: String,
    id: u64,
    listeners: Arc<Mutex<Listeners>>,
}

impl ListenerHandle {
    /// Stop delivering events to this listener.
    pub fn unsubscribe(self) {
        let mut listeners = self.listeners.lock();
        if let Some(list) = listeners.by_key.get_mut(&self.key) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                listeners.by_key.remove(&self.key);
            }
        }
    }
}

/// Local and session storage with TTL-wrapped items and key listeners.
#[derive(Clone)]
pub struct StorageService {
    local: Arc<dyn StorageBackend>,
    session: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    listeners: Arc<Mutex<Listeners>>,
    origin: u64,
}

impl StorageService {
    /// Create a service over the given local and session backends.
    pub fn new(local: Arc<dyn StorageBackend>, session: Arc<dyn StorageBackend>) -> Self {
        Self {
            local,
            session,
            clock: Arc::new(SystemClock),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// A service whose areas both live in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Arc::new(MemoryBackend::new()))
    }

    /// Another service over the same backends, as a second tab would have.
    pub fn attach(&self) -> Self {
        Self {
            local: Arc::clone(&self.local),
            session: Arc::clone(&self.session),
            clock: Arc::clone(&self.clock),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Replace the clock used for item expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Identifier stamped on events this service publishes.
    pub fn origin(&self) -> u64 {
        self.origin
    }

    fn backend(&self, area: StorageArea) -> &Arc<dyn StorageBackend> {
        match area {
            StorageArea::Local => &self.local,
            StorageArea::Session => &self.session,
        }
    }

    /// Store `value` under `key`, wrapped with an optional expiry.
    ///
    /// Returns `false` if the value could not be serialized or written.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: StorageOptions,
    ) -> bool {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize storage item");
                return false;
            }
        };
        let item = StoredItem {
            value,
            expires_at: options
                .ttl
                .map(|ttl| self.clock.now_millis().saturating_add(ttl.as_millis() as u64)),
        };
        let text = match serde_json::to_string(&item) {
            Ok(t) => t,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode storage item");
                return false;
            }
        };
        match self.set_raw(key, &text, options.area) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, area = ?options.area, error = %e, "Failed to write storage item");
                false
            }
        }
    }

    /// Read the item under `key`, removing it if its TTL has elapsed.
    pub fn get(&self, key: &str, area: StorageArea) -> Option<Value> {
        let text = match self.get_raw(key, area) {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, ?area, error = %e, "Failed to read storage item");
                return None;
            }
        };
        let item: StoredItem = match serde_json::from_str(&text) {
            Ok(item) => item,
            Err(e) => {
                warn!(key, ?area, error = %e, "Ignoring corrupt storage item");
                return None;
            }
        };
        if item
            .expires_at
            .is_some_and(|at| self.clock.now_millis() > at)
        {
            debug!(key, ?area, "Storage item expired");
            self.remove(key, area);
            return None;
        }
        Some(item.value)
    }

    /// Read and deserialize the item under `key`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str, area: StorageArea) -> Result<Option<T>> {
        match self.get(key, area) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Remove `key`. Returns whether it existed.
    pub fn remove(&self, key: &str, area: StorageArea) -> bool {
        match self.backend(area).remove_item(key) {
            Ok(Some(old)) => {
                self.emit(StorageEvent {
                    key: Some(key.to_string()),
                    area,
                    old_value: Some(old),
                    new_value: None,
                    origin: self.origin,
                });
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(key, ?area, error = %e, "Failed to remove storage item");
                false
            }
        }
    }

    /// Remove everything in `area`.
    pub fn clear(&self, area: StorageArea) -> bool {
        match self.backend(area).clear() {
            Ok(()) => {
                self.emit(StorageEvent {
                    key: None,
                    area,
                    old_value: None,
                    new_value: None,
                    origin: self.origin,
                });
                true
            }
            Err(e) => {
                warn!(?area, error = %e, "Failed to clear storage area");
                false
            }
        }
    }

    /// Keys present in `area`.
    pub fn keys(&self, area: StorageArea) -> Vec<String> {
        self.backend(area).keys().unwrap_or_else(|e| {
            warn!(?area, error = %e, "Failed to list storage keys");
            Vec::new()
        })
    }

    /// Read unwrapped text.
    pub fn get_raw(
        &self,
        key: &str,
        area: StorageArea,
    ) -> std::result::Result<Option<String>, StorageError> {
        self.backend(area).get_item(key)
    }

    /// Write unwrapped text, publishing a change event.
    pub fn set_raw(
        &self,
        key: &str,
        text: &str,
        area: StorageArea,
    ) -> std::result::Result<(), StorageError> {
        let old = self.backend(area).set_item(key, text)?;
        self.emit(StorageEvent {
            key: Some(key.to_string()),
            area,
            old_value: old,
            new_value: Some(text.to_string()),
            origin: self.origin,
        });
        Ok(())
    }

    /// Register `listener` for changes to `key` in either area.
    ///
    /// Clearing an area notifies every listener.
    pub fn subscribe<F>(&self, key: impl Into<String>, listener: F) -> ListenerHandle
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        let key = key.into();
        let mut listeners = self.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners
            .by_key
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        ListenerHandle {
            key,
            id,
            listeners: Arc::clone(&self.listeners),
        }
    }

    /// Stream of every change to either area, from any attached service.
    pub fn changes(&self) -> StorageEventStream {
        StorageEventStream {
            local: BroadcastStream::new(self.local.bus().subscribe()),
            session: BroadcastStream::new(self.session.bus().subscribe()),
        }
    }

    /// Forward changes made by other services to this service's listeners.
    ///
    /// Returns the forwarding task; abort it to stop.
    pub fn listen_remote(&self) -> Result<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StateError::NoRuntime(e.to_string()))?;
        let mut changes = self.changes();
        let listeners = Arc::clone(&self.listeners);
        let origin = self.origin;
        Ok(runtime.spawn(async move {
            while let Some(event) = changes.next().await {
                if event.origin != origin {
                    dispatch(&listeners, &event);
                }
            }
        }))
    }

    fn emit(&self, event: StorageEvent) {
        dispatch(&self.listeners, &event);
        self.backend(event.area).bus().publish(event);
    }
}

fn dispatch(listeners: &Mutex<Listeners>, event: &StorageEvent) {
    // Snapshot under the lock, call outside it so listeners may re-enter.
    let targets: Vec<Listener> = {
        let listeners = listeners.lock();
        match &event.key {
            Some(key) => listeners
                .by_key
                .get(key)
                .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default(),
            None => listeners
                .by_key
                .values()
                .flat_map(|list| list.iter().map(|(_, l)| Arc::clone(l)))
                .collect(),
        }
    };
    trace!(key = ?event.key, listeners = targets.len(), "Dispatching storage event");
    for listener in targets {
        listener(event);
    }
}

/// Merged stream of local and session storage events.
pub struct StorageEventStream {
    local: BroadcastStream<StorageEvent>,
    session: BroadcastStream<StorageEvent>,
}

impl StorageEventStream {
    fn poll_area(
        stream: &mut BroadcastStream<StorageEvent>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<StorageEvent>> {
        loop {
            match Pin::new(&mut *stream).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(n)))) => {
                    warn!(skipped = n, "Storage event stream lagged");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Stream for StorageEventStream {
    type Item = StorageEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let local = Self::poll_area(&mut this.local, cx);
        if let Poll::Ready(Some(event)) = local {
            return Poll::Ready(Some(event));
        }
        let session = Self::poll_area(&mut this.session, cx);
        match (local, session) {
            (_, Poll::Ready(Some(event))) => Poll::Ready(Some(event)),
            (Poll::Ready(None), Poll::Ready(None)) => Poll::Ready(None),
            _ => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn service_with_clock() -> (StorageService, ManualClock) {
        let clock = ManualClock::new(1_000);
        let service = StorageService::in_memory().with_clock(Arc::new(clock.clone()));
        (service, clock)
    }

    #[test]
    fn test_set_and_get() {
        let (service, _) = service_with_clock();

        assert!(service.set("user", &json!({"id": 1}), StorageOptions::default()));
        assert_eq!(service.get("user", StorageArea::Local), Some(json!({"id": 1})));
        assert_eq!(service.get("user", StorageArea::Session), None);
    }

    #[test]
    fn test_item_envelope_format() {
        let (service, _) = service_with_clock();
        service.set(
            "theme",
            "dark",
            StorageOptions::area(StorageArea::Session).with_ttl(Duration::from_millis(500)),
        );

        let raw = service.get_raw("theme", StorageArea::Session).unwrap().unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, json!({"value": "dark", "expiresAt": 1_500}));
    }

    #[test]
    fn test_ttl_expiry_removes_item() {
        let (service, clock) = service_with_clock();
        service.set(
            "token",
            "abc",
            StorageOptions::default().with_ttl(Duration::from_millis(100)),
        );

        clock.advance(Duration::from_millis(100));
        assert_eq!(service.get("token", StorageArea::Local), Some(json!("abc")));

        clock.advance(Duration::from_millis(1));
        assert_eq!(service.get("token", StorageArea::Local), None);
        assert!(service.keys(StorageArea::Local).is_empty());
    }

    #[test]
    fn test_corrupt_item_reads_as_none() {
        let (service, _) = service_with_clock();
        service.set_raw("broken", "{not json", StorageArea::Local).unwrap();
        assert_eq!(service.get("broken", StorageArea::Local), None);
    }

    #[test]
    fn test_get_json() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Prefs {
            lang: String,
        }

        let (service, _) = service_with_clock();
        service.set("prefs", &json!({"lang": "en"}), StorageOptions::default());
        let prefs: Prefs = service.get_json("prefs", StorageArea::Local).unwrap().unwrap();
        assert_eq!(prefs, Prefs { lang: "en".to_string() });
    }

    #[test]
    fn test_quota_failure_returns_false() {
        let service = StorageService::new(
            Arc::new(MemoryBackend::with_quota(16)),
            Arc::new(MemoryBackend::new()),
        );
        assert!(!service.set("big", &"x".repeat(64), StorageOptions::default()));
        assert_eq!(service.get("big", StorageArea::Local), None);
    }

    #[test]
    fn test_remove_and_clear() {
        let (service, _) = service_with_clock();
        service.set("a", &1, StorageOptions::default());
        service.set("b", &2, StorageOptions::default());

        assert!(service.remove("a", StorageArea::Local));
        assert!(!service.remove("a", StorageArea::Local));
        assert!(service.clear(StorageArea::Local));
        assert!(service.keys(StorageArea::Local).is_empty());
    }

    #[test]
    fn test_key_listeners() {
        let (service, _) = service_with_clock();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let handle = service.subscribe("lang", move |event| {
            assert_eq!(event.key.as_deref().unwrap_or("lang"), "lang");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        service.set("lang", "en", StorageOptions::default());
        service.set("other", "x", StorageOptions::default());
        service.remove("lang", StorageArea::Local);
        service.clear(StorageArea::Session);
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        handle.unsubscribe();
        service.set("lang", "fr", StorageOptions::default());
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attached_services_see_remote_changes() {
        let first = StorageService::in_memory();
        let second = first.attach();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let _handle = second.subscribe("session-id", move |event| {
            assert!(event.new_value.is_some());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let task = second.listen_remote().unwrap();

        first.set("session-id", "s-1", StorageOptions::default());

        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(second.get("session-id", StorageArea::Local), Some(json!("s-1")));
        task.abort();
    }

    #[tokio::test]
    async fn test_change_stream() {
        let service = StorageService::in_memory();
        let mut changes = service.changes();

        service.set("a", &1, StorageOptions::area(StorageArea::Session));
        let event = changes.next().await.unwrap();
        assert_eq!(event.key.as_deref(), Some("a"));
        assert_eq!(event.area, StorageArea::Session);
        assert_eq!(event.origin, service.origin());
        assert!(event.old_value.is_none());
    }
}
