//! Error types for the store.
//!
//! Persistence problems ([`StoreError::Hydration`], [`StoreError::Persist`])
//! and subscriber panics ([`StoreError::Subscriber`]) are built and logged at
//! the store boundary but never handed back to callers: losing the mirror must
//! not break the in-memory state. Loader and serialization failures are
//! returned because the caller can act on them.

use crate::config::ConfigError;

/// Boxed error returned by demand-cache loaders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by a [`PersistenceAdapter`](crate::persist::PersistenceAdapter).
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Filesystem or device I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document could not be encoded or decoded.
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend refused the operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the store and its facades.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or parsing the persisted copy failed during first load.
    #[error("failed to hydrate {key}: {source}")]
    Hydration {
        /// Physical key that was read.
        key: String,
        /// Underlying failure.
        #[source]
        source: AdapterError,
    },

    /// Write-through to storage failed.
    #[error("failed to persist {key}: {source}")]
    Persist {
        /// Physical key that was written or removed.
        key: String,
        /// Underlying failure.
        #[source]
        source: AdapterError,
    },

    /// A subscriber panicked while being notified.
    #[error("subscriber for {key} panicked: {message}")]
    Subscriber {
        /// Entry the notification was for.
        key: String,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// A demand-cache loader returned an error.
    #[error("loader for {scope}/{key} failed: {source}")]
    Loader {
        /// Scope the loader ran in.
        scope: String,
        /// Key being loaded.
        key: String,
        /// Error returned by the loader.
        #[source]
        source: BoxError,
    },

    /// A caller-supplied value could not be converted to or from JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store configuration was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
