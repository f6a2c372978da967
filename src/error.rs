//! Error types for the sync client and host.

use thiserror::Error;

/// Main error type for connection, transport and replication operations.
///
/// Reducer failures are not represented here: they travel to subscribers as
/// [`Status::Failed`](crate::types::Status) inside a reducer event.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Protocol violation in table {table}: {reason}")]
    ProtocolViolation { table: String, reason: String },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown reducer: {0}")]
    UnknownReducer(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub(crate) fn violation(table: &str, reason: impl Into<String>) -> Self {
        SyncError::ProtocolViolation {
            table: table.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
