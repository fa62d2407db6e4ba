//! Error types for code stores.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by a [`CodeStore`](crate::CodeStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A namespace or id cannot be used as a storage key.
    #[error("invalid key component '{component}': {message}")]
    InvalidKey { component: String, message: String },

    /// The store root could not be used.
    #[error("store root {} is invalid: {error}", path.display())]
    RootPathInvalid {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// An I/O failure while touching a stored key.
    #[error("i/o error on {}: {error}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// A lock protecting store state was poisoned.
    #[error("lock poisoned")]
    Poisoned,

    /// Generic error with message.
    #[error("{message}")]
    Other { message: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            error,
        }
    }

    /// Whether the error was caused by the caller's key rather than the store.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, StoreError::InvalidKey { .. })
    }
}
