//! Error types for state, storage and token operations.
//!
//! Only a handful of operations surface errors to callers: key validation,
//! (de)serialization of typed values, and explicit lifecycle calls. Storage
//! and watcher failures inside the manager are logged and swallowed.

use thiserror::Error;

/// Errors surfaced by the state manager.
#[derive(Debug, Error)]
pub enum StateError {
    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// The manager was destroyed and no longer accepts work.
    #[error("state manager destroyed")]
    Destroyed,

    /// A background task needs a tokio runtime and none is running.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// Error from the storage layer.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A session token could not be decoded.
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Result type alias for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::SerializationError(err.to_string())
    }
}

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Writing would exceed the area's byte quota.
    #[error("storage quota exceeded: {used} of {quota} bytes in use, write needs {requested}")]
    QuotaExceeded {
        quota: usize,
        used: usize,
        requested: usize,
    },

    /// Stored text could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StorageError {
    /// Returns true if retrying after freeing space could succeed.
    pub fn is_quota(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors raised while decoding a signed token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// Token does not have exactly three dot-separated segments.
    #[error("malformed token: expected 3 segments, found {0}")]
    Malformed(usize),

    /// Payload segment is not valid base64url.
    #[error("invalid token encoding: {0}")]
    Encoding(String),

    /// Payload is not a JSON object of claims.
    #[error("invalid token claims: {0}")]
    Claims(String),

    /// The `exp` claim is already in the past.
    #[error("token expired at {0} ms")]
    Expired(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StateError::InvalidKey("key cannot be empty".to_string());
        assert!(err.to_string().contains("invalid key"));
        assert!(err.to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_quota_display() {
        let err = StorageError::QuotaExceeded {
            quota: 10,
            used: 8,
            requested: 5,
        };
        assert!(err.to_string().contains("8 of 10"));
        assert!(err.is_quota());
        assert!(!StorageError::Serialization("x".into()).is_quota());
    }

    #[test]
    fn test_storage_error_is_transparent() {
        let err: StateError = StorageError::Serialization("bad".to_string()).into();
        assert_eq!(err.to_string(), "serialization error: bad");
    }

    #[test]
    fn test_token_error_display() {
        assert_eq!(
            TokenError::Malformed(2).to_string(),
            "malformed token: expected 3 segments, found 2"
        );
        assert_eq!(
            TokenError::Expired(1_000).to_string(),
            "token expired at 1000 ms"
        );
    }

    #[test]
    fn test_storage_error_kinds() {
        let kind = |err: &StorageError| match err {
            StorageError::QuotaExceeded { .. } => "quota",
            StorageError::Serialization(_) => "serialization",
            StorageError::Database(_) => "database",
        };
        let sqlite: StorageError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(kind(&sqlite), "database");
        let json: StorageError = serde_json::from_str::<u8>("x").unwrap_err().into();
        assert_eq!(kind(&json), "serialization");
    }
}
