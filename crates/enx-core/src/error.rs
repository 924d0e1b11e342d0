use thiserror::Error;

/// Core error types for ENX domain operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid health authority: {0}")]
    InvalidAuthority(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid time range: thru {thru} precedes from {from}")]
    InvalidTimeRange { from: i64, thru: i64 },
}

impl CoreError {
    /// Create a new InvalidAuthority error
    pub fn invalid_authority(message: impl Into<String>) -> Self {
        Self::InvalidAuthority(message.into())
    }

    /// Create a new InvalidPublicKey error
    pub fn invalid_public_key(message: impl Into<String>) -> Self {
        Self::InvalidPublicKey(message.into())
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
