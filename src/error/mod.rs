//! Error types for durq.

use thiserror::Error;

/// Result type for durq operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for durq.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage backend error.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Message not found.
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Payload encoding/decoding error.
    #[error("Payload codec error: {0}")]
    PayloadCodec(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Validation error types.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid queue name.
    #[error("Invalid queue name: {0}")]
    InvalidQueueName(String),

    /// Invalid queue table name.
    #[error("Invalid queue table name: {0}")]
    InvalidTableName(String),

    /// Ordered messages require a non-empty key.
    #[error("Ordered message key must not be empty")]
    EmptyOrderingKey,

    /// Invalid parameter.
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Reason for invalidity.
        reason: String,
    },
}
