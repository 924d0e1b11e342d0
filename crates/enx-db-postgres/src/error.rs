//! Error types for the PostgreSQL storage backend.

use enx_storage::StorageError;

/// PostgreSQL SQLSTATE for a serialization failure under serializable
/// isolation.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// PostgreSQL SQLSTATE for a unique constraint violation.
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

/// Errors specific to the PostgreSQL storage backend.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database error from the driver.
    #[error("Database error: {0}")]
    Database(#[from] sqlx_core::error::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PostgresError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the underlying database error is a serialization failure
    /// that the caller should retry.
    #[must_use]
    pub fn is_serialization_failure(&self) -> bool {
        self.has_sqlstate(SQLSTATE_SERIALIZATION_FAILURE)
    }

    /// Whether the underlying database error is a unique violation.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        self.has_sqlstate(SQLSTATE_UNIQUE_VIOLATION)
    }

    fn has_sqlstate(&self, sqlstate: &str) -> bool {
        match self {
            Self::Database(sqlx_core::error::Error::Database(db)) => {
                db.code().is_some_and(|code| code == sqlstate)
            }
            _ => false,
        }
    }
}

impl From<PostgresError> for StorageError {
    fn from(err: PostgresError) -> Self {
        if err.is_serialization_failure() {
            return StorageError::serialization(err.to_string());
        }
        if err.is_unique_violation() {
            return StorageError::conflict(err.to_string());
        }
        match err {
            PostgresError::Database(sqlx_core::error::Error::PoolTimedOut) => {
                StorageError::connection("pool acquire timed out")
            }
            PostgresError::Database(sqlx_core::error::Error::Io(e)) => {
                StorageError::connection(e.to_string())
            }
            PostgresError::Database(e) => StorageError::internal(e.to_string()),
            PostgresError::Config { message } => {
                StorageError::internal(format!("configuration error: {message}"))
            }
        }
    }
}

/// Converts a raw driver error straight to a [`StorageError`].
pub(crate) fn storage_err(err: sqlx_core::error::Error) -> StorageError {
    PostgresError::from(err).into()
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_conversion() {
        let err = PostgresError::config("bad url");
        assert!(!err.is_serialization_failure());
        let storage: StorageError = err.into();
        assert!(matches!(storage, StorageError::Internal { .. }));
    }
}
