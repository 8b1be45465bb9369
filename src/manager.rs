//! The state manager: keyed values with metadata, watchers, TTL expiry,
//! size-bounded garbage collection and optional persistence.
//!
//! A manager is constructed explicitly and shared by cloning; clones are
//! handles to the same state. All operations are synchronous. Watchers run
//! after the state lock is released, so a watcher may call back into the
//! manager.
//!
//! ## Expiry
//!
//! An entry with a TTL expires once `now - last_updated > ttl`. [`get`]
//! removes expired entries it encounters and the GC sweep removes the rest.
//! [`has`], [`keys`] and [`size`] never evict, so between sweeps they can
//! report entries that are already expired.
//!
//! [`get`]: StateManager::get
//! [`has`]: StateManager::has
//! [`keys`]: StateManager::keys
//! [`size`]: StateManager::size

use parking_lot::{Mutex, ReentrantMutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{ManagerConfig, DEFAULT_GC_INTERVAL};
use crate::equality::{StructuralEq, ValueEquality};
use crate::error::{Result, StateError};
use crate::gc::{GcReport, GcTimer};
use crate::snapshot::{EntryMetadata, Snapshot};
use crate::storage::{StorageArea, StorageService};
use crate::watch::{
    invoke, Callback, StateUpdate, UpdateSender, UpdateStream, WatchHandle, WatcherRegistry,
};

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Validate that a key is well-formed.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StateError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StateError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

/// Options for [`StateManager::set`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Entry expires this long after the write.
    pub ttl: Option<Duration>,
    /// Free-form tag recording who wrote the value.
    pub source: Option<String>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            source: None,
        }
    }

    pub fn source(source: impl Into<String>) -> Self {
        Self {
            ttl: None,
            source: Some(source.into()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Options for [`StateManager::watch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Also deliver the current value once, asynchronously.
    pub immediate: bool,
}

impl WatchOptions {
    pub fn immediate() -> Self {
        Self { immediate: true }
    }
}

#[derive(Default)]
struct Tables {
    values: HashMap<String, Value>,
    metadata: HashMap<String, EntryMetadata>,
}

struct Persistence {
    storage: StorageService,
    key: String,
    area: StorageArea,
    /// Held from snapshot capture through the write, so a slower writer can
    /// never store an older snapshot over a newer one.
    writer: ReentrantMutex<()>,
}

struct Inner {
    config: ManagerConfig,
    tables: Mutex<Tables>,
    watchers: WatcherRegistry,
    updates: UpdateSender,
    persistence: Option<Persistence>,
    clock: Arc<dyn Clock>,
    equality: Arc<dyn ValueEquality>,
    gc: GcTimer,
    destroyed: AtomicBool,
}

/// Builder for [`StateManager`].
pub struct StateManagerBuilder {
    config: ManagerConfig,
    storage: Option<StorageService>,
    clock: Arc<dyn Clock>,
    equality: Arc<dyn ValueEquality>,
}

impl StateManagerBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Storage used when `config.persist` is set.
    pub fn storage(mut self, storage: StorageService) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Strategy deciding whether a `set` changes anything.
    pub fn equality(mut self, equality: Arc<dyn ValueEquality>) -> Self {
        self.equality = equality;
        self
    }

    /// Build the manager, hydrating persisted state and starting the GC
    /// timer when configured.
    ///
    /// Without a tokio runtime the timer is not started; sweeps can still be
    /// run with [`StateManager::collect_garbage`].
    pub fn build(self) -> StateManager {
        let persistence = match (self.config.persist, self.storage) {
            (true, Some(storage)) => Some(Persistence {
                storage,
                key: self.config.storage_key.clone(),
                area: self.config.storage_area,
                writer: ReentrantMutex::new(()),
            }),
            (true, None) => {
                warn!("Persistence requested without a storage service, state stays in memory");
                None
            }
            (false, _) => None,
        };

        let tables = match &persistence {
            Some(p) => hydrate(p, self.clock.now_millis()),
            None => Tables::default(),
        };

        let manager = StateManager {
            inner: Arc::new(Inner {
                updates: UpdateSender::new(self.config.update_channel_capacity),
                config: self.config,
                tables: Mutex::new(tables),
                watchers: WatcherRegistry::default(),
                persistence,
                clock: self.clock,
                equality: self.equality,
                gc: GcTimer::new(),
                destroyed: AtomicBool::new(false),
            }),
        };

        if manager.inner.config.gc_interval.is_some() {
            if let Err(e) = manager.start_gc() {
                warn!(error = %e, "GC timer not started");
            }
        }
        manager
    }
}

fn hydrate(persistence: &Persistence, now: u64) -> Tables {
    let text = match persistence.storage.get_raw(&persistence.key, persistence.area) {
        Ok(Some(text)) => text,
        Ok(None) => return Tables::default(),
        Err(e) => {
            warn!(key = %persistence.key, error = %e, "Failed to read persisted state");
            return Tables::default();
        }
    };
    match Snapshot::from_json(&text) {
        Ok(snapshot) => {
            let (values, metadata) = snapshot.restore(now);
            info!(key = %persistence.key, entries = values.len(), "Hydrated persisted state");
            Tables { values, metadata }
        }
        Err(e) => {
            warn!(key = %persistence.key, error = %e, "Ignoring corrupt persisted state");
            Tables::default()
        }
    }
}

/// In-memory keyed state with watchers, expiry and persistence.
#[derive(Clone)]
pub struct StateManager {
    inner: Arc<Inner>,
}

impl StateManager {
    /// Create a manager with the given config and no persistence backend.
    pub fn new(config: ManagerConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Create a manager persisting through `storage` when `config.persist`
    /// is set.
    pub fn with_storage(config: ManagerConfig, storage: StorageService) -> Self {
        Self::builder().config(config).storage(storage).build()
    }

    pub fn builder() -> StateManagerBuilder {
        StateManagerBuilder {
            config: ManagerConfig::default(),
            storage: None,
            clock: Arc::new(SystemClock),
            equality: Arc::new(StructuralEq),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// The clock used for timestamps and expiry.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(StateError::Destroyed);
        }
        Ok(())
    }

    /// Store `value` under `key`.
    ///
    /// If the value equals the current one nothing happens: no version bump,
    /// no notification, no persistence. Otherwise the metadata is refreshed,
    /// watchers run, and state is persisted. Returns the entry's version.
    pub fn set(&self, key: &str, value: Value, options: SetOptions) -> Result<u64> {
        self.ensure_live()?;
        validate_key(key)?;
        let now = self.inner.clock.now_millis();

        let (update, version) = {
            let mut tables = self.inner.tables.lock();
            let previous = tables.metadata.get(key).cloned();
            let live = previous.as_ref().is_some_and(|m| !m.is_expired(now));

            if live {
                if let (Some(current), Some(meta)) = (tables.values.get(key), &previous) {
                    if self.inner.equality.equals(current, &value) {
                        return Ok(meta.version);
                    }
                }
            }

            let version = previous.map_or(1, |m| m.version + 1);
            let prev_value = tables.values.insert(key.to_string(), value.clone());
            tables.metadata.insert(
                key.to_string(),
                EntryMetadata {
                    last_updated: now,
                    version,
                    source: options.source,
                    ttl: options.ttl,
                },
            );
            // An expired value is gone as far as observers are concerned
            let prev_value = if live { prev_value } else { None };
            (StateUpdate::new(key, prev_value, Some(value), now), version)
        };

        debug!(key, version, "State set");
        self.dispatch(update);
        self.persist();
        Ok(version)
    }

    /// Serialize `value` to JSON and [`set`](Self::set) it.
    pub fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<u64> {
        let value = serde_json::to_value(value)?;
        self.set(key, value, options)
    }

    /// Current value of `key`, or `None` if absent or expired.
    ///
    /// An expired entry is removed, and its watchers notified, before
    /// returning. If the key is rewritten between the expiry check and the
    /// removal, the new value is kept and returned.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.inner.clock.now_millis();
        {
            let tables = self.inner.tables.lock();
            match tables.metadata.get(key) {
                Some(meta) if meta.is_expired(now) => {}
                _ => return tables.values.get(key).cloned(),
            }
        }
        debug!(key, "State expired on read");
        let removed = self.remove_keys(&[key.to_string()], |_, meta| meta.is_expired(now));
        if removed.is_empty() {
            return self.inner.tables.lock().values.get(key).cloned();
        }
        None
    }

    /// [`get`](Self::get) and deserialize.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Register `callback` for changes to `key`.
    ///
    /// With [`WatchOptions::immediate`] and a current non-null value, the
    /// callback additionally receives one update with `prev == next ==
    /// current`. That delivery is spawned on the tokio runtime and never
    /// happens inside this call; without a runtime it is skipped.
    pub fn watch<F>(&self, key: &str, callback: F, options: WatchOptions) -> WatchHandle
    where
        F: Fn(&StateUpdate) + Send + Sync + 'static,
    {
        if self.is_destroyed() {
            warn!(key, "Ignoring watch on a destroyed manager");
            return WatchHandle::detached(key);
        }
        let callback: Callback = Arc::new(callback);
        let handle = self.inner.watchers.register(key, Arc::clone(&callback));

        if options.immediate {
            if let Some(current) = self.get(key).filter(|v| !v.is_null()) {
                self.deliver_later(&handle, callback, current);
            }
        }
        handle
    }

    fn deliver_later(&self, handle: &WatchHandle, callback: Callback, current: Value) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(key = handle.key(), error = %e, "Immediate watch delivery skipped");
                return;
            }
        };
        let update = StateUpdate::new(
            handle.key(),
            Some(current.clone()),
            Some(current),
            self.inner.clock.now_millis(),
        );
        let watchers = self.inner.watchers.clone();
        let id = handle.id();
        runtime.spawn(async move {
            // Skip if unwatched before the task ran
            if watchers.contains(&update.key, id) {
                invoke(&callback, &update);
            }
        });
    }

    /// Stream of updates for keys matching `pattern` (exact, or `prefix*`).
    pub fn subscribe(&self, pattern: impl Into<String>) -> UpdateStream {
        self.inner.updates.subscribe(pattern)
    }

    /// Remove `key`. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        !self.remove_keys(&[key.to_string()], |_, _| true).is_empty()
    }

    /// Remove every entry, notifying the watchers of each removed key.
    pub fn clear(&self) {
        let now = self.inner.clock.now_millis();
        let mut removed: Vec<(String, Value)> = {
            let mut tables = self.inner.tables.lock();
            tables.metadata.clear();
            tables.values.drain().collect()
        };
        removed.sort_by(|a, b| a.0.cmp(&b.0));

        debug!(entries = removed.len(), "State cleared");
        for (key, value) in removed {
            self.dispatch(StateUpdate::new(key, Some(value), None, now));
        }
        self.persist();
    }

    /// Whether `key` is present. Does not check expiry.
    pub fn has(&self, key: &str) -> bool {
        self.inner.tables.lock().values.contains_key(key)
    }

    /// All present keys, sorted. Does not check expiry.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.tables.lock().values.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of present entries. Does not check expiry.
    pub fn size(&self) -> usize {
        self.inner.tables.lock().values.len()
    }

    /// Metadata for `key`. Does not check expiry.
    pub fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        self.inner.tables.lock().metadata.get(key).cloned()
    }

    /// Current version of `key` (0 if absent).
    pub fn version(&self, key: &str) -> u64 {
        self.metadata(key).map_or(0, |m| m.version)
    }

    /// Number of callbacks watching `key`.
    pub fn watcher_count(&self, key: &str) -> usize {
        self.inner.watchers.count(key)
    }

    /// Number of live [`UpdateStream`]s.
    pub fn subscriber_count(&self) -> usize {
        self.inner.updates.receiver_count()
    }

    /// Run one sweep: drop expired entries, then evict the least recently
    /// updated entries while more than `max_states` remain.
    pub fn collect_garbage(&self) -> GcReport {
        let now = self.inner.clock.now_millis();
        let max = self.inner.config.max_states;

        let (expired, evicted) = {
            let tables = self.inner.tables.lock();
            let mut expired = Vec::new();
            let mut live = Vec::new();
            for (key, meta) in &tables.metadata {
                if meta.is_expired(now) {
                    expired.push(key.clone());
                } else {
                    live.push((meta.last_updated, key.clone(), meta.version));
                }
            }
            let mut evicted = Vec::new();
            if live.len() > max {
                live.sort();
                let excess = live.len() - max;
                evicted.extend(live.into_iter().take(excess));
            }
            (expired, evicted)
        };

        if expired.is_empty() && evicted.is_empty() {
            return GcReport::default();
        }

        // Evict only entries nobody rewrote since the scan
        let stamps: HashMap<&str, (u64, u64)> = evicted
            .iter()
            .map(|(last_updated, key, version)| (key.as_str(), (*last_updated, *version)))
            .collect();
        let mut keys = expired;
        keys.extend(evicted.iter().map(|(_, key, _)| key.clone()));
        let removed = self.remove_keys(&keys, |key, meta| match stamps.get(key) {
            Some(&(last_updated, version)) => {
                meta.last_updated == last_updated && meta.version == version
            }
            None => meta.is_expired(now),
        });

        let expired_count = removed
            .iter()
            .filter(|key| !stamps.contains_key(key.as_str()))
            .count();
        let report = GcReport {
            expired: expired_count,
            evicted: removed.len() - expired_count,
        };
        debug!(expired = report.expired, evicted = report.evicted, "GC sweep");
        report
    }

    /// Start the periodic sweep. No-op if already running.
    ///
    /// Uses `config.gc_interval`, or the default interval if the config
    /// disabled the timer.
    pub fn start_gc(&self) -> Result<()> {
        self.ensure_live()?;
        let interval = self.inner.config.gc_interval.unwrap_or(DEFAULT_GC_INTERVAL);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.gc.start(interval, move || match weak.upgrade() {
            Some(inner) => {
                StateManager { inner }.collect_garbage();
                true
            }
            None => false,
        })
    }

    /// Stop the periodic sweep. Returns whether it was running.
    pub fn stop_gc(&self) -> bool {
        self.inner.gc.stop()
    }

    pub fn is_gc_running(&self) -> bool {
        self.inner.gc.is_running()
    }

    /// Interval of the running GC timer.
    pub fn gc_interval(&self) -> Option<Duration> {
        self.inner.gc.interval()
    }

    /// Stop GC, drop all state and watchers, and refuse further writes.
    ///
    /// Persisted state is left as it was; watchers are not notified.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.gc.stop();
        {
            let mut tables = self.inner.tables.lock();
            tables.values.clear();
            tables.metadata.clear();
        }
        self.inner.watchers.clear();
        info!("State manager destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Remove `keys` through the common path: delete value and metadata,
    /// notify watchers, persist once.
    ///
    /// `still_removable` is checked under the state lock for every key that
    /// has metadata; keys it rejects are kept. Returns the removed keys.
    fn remove_keys<P>(&self, keys: &[String], still_removable: P) -> Vec<String>
    where
        P: Fn(&str, &EntryMetadata) -> bool,
    {
        let now = self.inner.clock.now_millis();
        let removed: Vec<(String, Value)> = {
            let mut tables = self.inner.tables.lock();
            keys.iter()
                .filter_map(|key| {
                    if tables
                        .metadata
                        .get(key)
                        .is_some_and(|meta| !still_removable(key.as_str(), meta))
                    {
                        return None;
                    }
                    tables.metadata.remove(key);
                    tables.values.remove(key).map(|value| (key.clone(), value))
                })
                .collect()
        };

        if removed.is_empty() {
            return Vec::new();
        }
        let mut keys = Vec::with_capacity(removed.len());
        for (key, value) in removed {
            debug!(key = %key, "State removed");
            keys.push(key.clone());
            self.dispatch(StateUpdate::new(key, Some(value), None, now));
        }
        self.persist();
        keys
    }

    fn dispatch(&self, update: StateUpdate) {
        self.inner.watchers.notify(&update);
        self.inner.updates.send(update);
    }

    /// Write the full snapshot. Failures are logged, never returned.
    ///
    /// The snapshot is taken after acquiring the writer lock, so the last
    /// write to land always reflects the latest state.
    fn persist(&self) {
        let Some(persistence) = &self.inner.persistence else {
            return;
        };
        if self.is_destroyed() {
            return;
        }
        let _writing = persistence.writer.lock();
        let snapshot = {
            let tables = self.inner.tables.lock();
            Snapshot::capture(&tables.values, &tables.metadata)
        };
        let text = match snapshot.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(key = %persistence.key, error = %e, "Failed to serialize state");
                return;
            }
        };
        if let Err(e) = persistence
            .storage
            .set_raw(&persistence.key, &text, persistence.area)
        {
            warn!(key = %persistence.key, error = %e, "Failed to persist state");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.gc.stop();
    }
}
