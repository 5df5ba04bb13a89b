//! Error types for Courier gateway

use thiserror::Error;

/// Result type alias for Courier operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Courier gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient transport failure (retried with backoff)
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote protocol invalidated the session; re-pairing is required
    #[error("session auth invalidated: {0}")]
    AuthInvalidated(String),

    /// A connection attempt for this instance is already in flight
    #[error("instance {0} is already connecting")]
    AlreadyConnecting(String),

    /// Instance is already paired; pairing codes cannot be reissued
    #[error("instance {0} is already paired")]
    AlreadyPaired(String),

    /// Phone number failed format validation
    #[error("invalid phone number format: {0}")]
    InvalidPhoneFormat(String),

    /// Send attempted while the session is not connected
    #[error("instance {0} is not connected")]
    NotConnected(String),

    /// Shared broker store is unavailable (advisory via the health guard)
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Input rejected before enqueue; never retried
    #[error("validation error: {0}")]
    Validation(String),

    /// AI reply-generation error
    #[error("reply generation error: {0}")]
    ReplyGeneration(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether this error is transient and worth retrying
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::BrokerUnavailable(_) | Self::Http(_)
        )
    }
}
