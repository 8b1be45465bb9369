//! Watchers and update streams for reactive state changes.
//!
//! Two ways to observe the manager:
//! - per-key callbacks, invoked synchronously in registration order
//! - [`UpdateStream`]s, broadcast-backed async streams filtered by pattern

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::{error, trace, warn};

/// An immutable record of one change to a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    /// The key that changed.
    pub key: String,
    /// Value before the change (`None` if the key did not exist).
    pub prev_value: Option<Value>,
    /// Value after the change (`None` if the key was removed).
    pub next_value: Option<Value>,
    /// When the change happened, in Unix milliseconds.
    pub timestamp: u64,
}

impl StateUpdate {
    pub fn new(
        key: impl Into<String>,
        prev_value: Option<Value>,
        next_value: Option<Value>,
        timestamp: u64,
    ) -> Self {
        Self {
            key: key.into(),
            prev_value,
            next_value,
            timestamp,
        }
    }

    /// True if this update removed the key.
    pub fn is_removal(&self) -> bool {
        self.next_value.is_none()
    }
}

pub(crate) type Callback = Arc<dyn Fn(&StateUpdate) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_key: HashMap<String, Vec<(u64, Callback)>>,
}

/// Per-key ordered callback lists.
#[derive(Clone, Default)]
pub(crate) struct WatcherRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl WatcherRegistry {
    pub(crate) fn register(&self, key: &str, callback: Callback) -> WatchHandle {
        let mut registry = self.inner.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .by_key
            .entry(key.to_string())
            .or_default()
            .push((id, callback));
        WatchHandle {
            key: key.to_string(),
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Callbacks for `key`, in registration order.
    pub(crate) fn callbacks(&self, key: &str) -> Vec<Callback> {
        self.inner
            .lock()
            .by_key
            .get(key)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn contains(&self, key: &str, id: u64) -> bool {
        self.inner
            .lock()
            .by_key
            .get(key)
            .is_some_and(|list| list.iter().any(|(i, _)| *i == id))
    }

    pub(crate) fn count(&self, key: &str) -> usize {
        self.inner.lock().by_key.get(key).map_or(0, Vec::len)
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().by_key.clear();
    }

    /// Deliver `update` to every callback on its key.
    ///
    /// A panicking callback is logged and does not stop delivery to the rest.
    /// Must be called without holding the manager's state lock.
    pub(crate) fn notify(&self, update: &StateUpdate) {
        for callback in self.callbacks(&update.key) {
            invoke(&callback, update);
        }
    }
}

pub(crate) fn invoke(callback: &Callback, update: &StateUpdate) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(update))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(key = %update.key, panic = %message, "Watcher callback panicked");
    }
}

/// Registration returned by `StateManager::watch`.
///
/// Dropping the handle keeps the watcher registered; call
/// [`WatchHandle::unwatch`] to remove it.
#[derive(Debug)]
pub struct WatchHandle {
    key: String,
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl WatchHandle {
    /// The watched key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// A handle tied to no registry; `unwatch` does nothing.
    pub(crate) fn detached(key: &str) -> Self {
        Self {
            key: key.to_string(),
            id: 0,
            registry: Weak::new(),
        }
    }

    /// Remove this watcher. Other watchers on the key are unaffected.
    pub fn unwatch(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock();
        if let Some(list) = registry.by_key.get_mut(&self.key) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                registry.by_key.remove(&self.key);
            }
        }
        trace!(key = %self.key, id = self.id, "Watcher removed");
    }
}

/// A stream of state updates whose keys match a pattern.
///
/// Pattern can be an exact key or end with `*` for prefix matching.
pub struct UpdateStream {
    inner: BroadcastStream<StateUpdate>,
    pattern: String,
}

impl UpdateStream {
    /// Create a new update stream for the given pattern.
    pub fn new(receiver: broadcast::Receiver<StateUpdate>, pattern: impl Into<String>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
            pattern: pattern.into(),
        }
    }

    /// Get the pattern this stream is watching.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check if a key matches this stream's pattern.
    fn matches(&self, key: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == self.pattern,
        }
    }
}

impl Stream for UpdateStream {
    type Item = StateUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(update))) => {
                    if self.matches(&update.key) {
                        return Poll::Ready(Some(update));
                    }
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(n)))) => {
                    // Skip lagged updates
                    warn!(pattern = %self.pattern, skipped = n, "Update stream lagged");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Handle for publishing updates to stream subscribers.
#[derive(Clone)]
pub(crate) struct UpdateSender {
    sender: broadcast::Sender<StateUpdate>,
}

impl UpdateSender {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn send(&self, update: StateUpdate) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(update);
    }

    pub(crate) fn subscribe(&self, pattern: impl Into<String>) -> UpdateStream {
        UpdateStream::new(self.sender.subscribe(), pattern)
    }

    pub(crate) fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::StreamExt;

    fn update(key: &str) -> StateUpdate {
        StateUpdate::new(key, None, Some(json!(1)), 0)
    }

    #[test]
    fn test_state_update_serializes_camel_case() {
        let json = serde_json::to_value(StateUpdate::new("x", Some(json!(1)), None, 7)).unwrap();
        assert_eq!(
            json,
            json!({"key": "x", "prevValue": 1, "nextValue": null, "timestamp": 7})
        );
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let registry = WatcherRegistry::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = Arc::clone(&order);
            registry.register("k", Arc::new(move |_: &StateUpdate| order.lock().push(n)));
        }
        registry.notify(&update("k"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_delivery() {
        let registry = WatcherRegistry::default();
        let delivered = Arc::new(AtomicUsize::new(0));

        registry.register("k", Arc::new(|_: &StateUpdate| panic!("boom")));
        let counter = Arc::clone(&delivered);
        registry.register(
            "k",
            Arc::new(move |_: &StateUpdate| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.notify(&update("k"));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unwatch_removes_only_that_callback() {
        let registry = WatcherRegistry::default();
        let first = registry.register("k", Arc::new(|_: &StateUpdate| {}));
        let second = registry.register("k", Arc::new(|_: &StateUpdate| {}));
        assert_eq!(registry.count("k"), 2);

        let first_id = first.id();
        first.unwatch();
        assert_eq!(registry.count("k"), 1);
        assert!(!registry.contains("k", first_id));
        assert!(registry.contains("k", second.id()));
    }

    #[test]
    fn test_pattern_matching() {
        let sender = UpdateSender::new(16);
        let stream = sender.subscribe("auth/*");

        assert!(stream.matches("auth/token"));
        assert!(stream.matches("auth/"));
        assert!(!stream.matches("user"));
    }

    #[test]
    fn test_exact_pattern() {
        let sender = UpdateSender::new(16);
        let stream = sender.subscribe("user");

        assert!(stream.matches("user"));
        assert!(!stream.matches("users"));
        assert_eq!(sender.receiver_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_filters_by_pattern() {
        let sender = UpdateSender::new(16);
        let mut stream = sender.subscribe("auth/*");

        sender.send(update("user"));
        sender.send(update("auth/token"));

        let received = stream.next().await.unwrap();
        assert_eq!(received.key, "auth/token");
    }
}
