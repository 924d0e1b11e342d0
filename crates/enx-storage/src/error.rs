//! Error types shared by all storage backends.

use thiserror::Error;

/// Errors returned by storage operations.
///
/// `NotFound` and `AlreadyLocked` are distinguished because callers branch
/// on them: the key-lookup cache turns `NotFound` into a cached negative,
/// and the JWKS manager treats `AlreadyLocked` as a successful no-op.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested record does not exist.
    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    /// The named lock is held by another worker.
    #[error("Lock already held: {lock_id}")]
    AlreadyLocked { lock_id: String },

    /// A mutation matched zero rows or hit a constraint.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// A serialization failure under serializable isolation; retryable.
    #[error("Serialization failure: {message}")]
    Serialization { message: String },

    /// Transport-level database error.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Domain validation failure on data heading into storage.
    #[error(transparent)]
    Invalid(#[from] enx_core::CoreError),

    /// Anything else.
    #[error("Internal storage error: {message}")]
    Internal { message: String },
}

impl StorageError {
    /// Creates a new NotFound error.
    #[must_use]
    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }

    /// Creates a new AlreadyLocked error.
    #[must_use]
    pub fn already_locked(lock_id: impl Into<String>) -> Self {
        Self::AlreadyLocked {
            lock_id: lock_id.into(),
        }
    }

    /// Creates a new Conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a new Serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new Connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a new Internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this is the distinguished not-found outcome.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is the lock-held no-op outcome.
    #[must_use]
    pub fn is_already_locked(&self) -> bool {
        matches!(self, Self::AlreadyLocked { .. })
    }

    /// Whether the operation may be retried under serializable isolation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Serialization { .. })
    }
}
