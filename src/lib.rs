//! # console-state
//!
//! Client-side state layer for the audit console:
//!
//! - **State manager**: keyed JSON values with per-key metadata, watchers,
//!   TTL expiry, size-bounded garbage collection and optional persistence
//! - **Storage service**: local (SQLite) and session (memory) areas with
//!   TTL-wrapped items and change listeners
//! - **Token helpers**: decode access-token claims and schedule refreshes
//! - **Session tracker**: token and activity bookkeeping built on the manager
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use console_state::{ManagerConfig, SetOptions, StateManager, WatchOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> console_state::Result<()> {
//!     let state = StateManager::new(ManagerConfig::default());
//!
//!     let handle = state.watch(
//!         "user",
//!         |update| println!("{} -> {:?}", update.key, update.next_value),
//!         WatchOptions::default(),
//!     );
//!
//!     state.set("user", json!({"id": 1}), SetOptions::default())?;
//!     assert_eq!(state.get("user"), Some(json!({"id": 1})));
//!
//!     handle.unwatch();
//!     state.destroy();
//!     Ok(())
//! }
//! ```
//!
//! ## Persistence
//!
//! ```rust,no_run
//! use console_state::{
//!     ManagerConfig, MemoryBackend, SqliteBackend, StateManager, StorageArea, StorageService,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> console_state::Result<()> {
//!     let storage = StorageService::new(
//!         Arc::new(SqliteBackend::open("console.db")?),
//!         Arc::new(MemoryBackend::new()),
//!     );
//!     let state = StateManager::with_storage(
//!         ManagerConfig::default().with_persistence(StorageArea::Local),
//!         storage,
//!     );
//!     println!("restored {} entries", state.size());
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod equality;
pub mod error;
pub mod gc;
pub mod logging;
pub mod manager;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod token;
pub mod watch;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ManagerConfig, SessionConfig, DEFAULT_STORAGE_KEY};
pub use equality::{deep_equal, AlwaysChanged, StructuralEq, ValueEquality};
pub use error::{Result, StateError, StorageError, TokenError};
pub use gc::GcReport;
pub use manager::{SetOptions, StateManager, StateManagerBuilder, WatchOptions, MAX_KEY_LENGTH};
pub use session::SessionTracker;
pub use snapshot::{EntryMetadata, Snapshot};
pub use storage::{
    MemoryBackend, SqliteBackend, StorageArea, StorageBackend, StorageEvent, StorageOptions,
    StorageService,
};
pub use token::TokenClaims;
pub use watch::{StateUpdate, UpdateStream, WatchHandle};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::ManagerConfig;
    pub use crate::error::{Result, StateError};
    pub use crate::manager::{SetOptions, StateManager, WatchOptions};
    pub use crate::storage::{StorageArea, StorageService};
    pub use crate::watch::{StateUpdate, WatchHandle};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_manager_basic() {
        let state = StateManager::new(ManagerConfig::default().without_gc_timer());

        state.set("/test", json!("value"), SetOptions::default()).unwrap();
        assert_eq!(state.get("/test"), Some(json!("value")));
    }

    #[test]
    fn test_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<StateManager>();
        assert_send_sync::<StorageService>();
        assert_send_sync::<SessionTracker>();
    }
}
