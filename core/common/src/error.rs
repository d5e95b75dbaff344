//! Common error types for Fieldsync.

use thiserror::Error;

/// Top-level error type for Fieldsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No valid session for an operation requiring one.
    #[error("Not authenticated")]
    Unauthenticated,

    /// Remote call attempted while the authority is unreachable.
    ///
    /// Not an error for mutations (they fall back to local-pending), but
    /// terminal for refresh and queue-replay operations.
    #[error("Remote authority unreachable")]
    Unreachable,

    /// The remote authority rejected an operation (non-2xx response).
    #[error("Remote rejected ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// Backup integrity verification failed; the store was not touched.
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Local persistence failure. Fatal to the calling operation.
    #[error("Store error: {0}")]
    Store(String),

    /// SQLite error from the durable local store.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Decompression failed (truncated, corrupt or oversized input).
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Unknown codec tag byte in a compressed artifact.
    #[error("Unknown compression tag: {0:#04x}")]
    UnknownCompressionTag(u8),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
