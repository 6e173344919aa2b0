//! Error types for fieldsync-core

use thiserror::Error;

/// Result type alias using fieldsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity or draft not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The requested mutation is not allowed from the row's current state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A persisted row could not be decoded
    #[error("Corrupt row {local_id}: {message}")]
    Corrupt { local_id: String, message: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
