//! Error types for the sync engine.

use thiserror::Error;

use crate::types::{Operation, Table};

/// Errors that can occur while loading snapshots or consuming the change feed.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A snapshot read for one collection failed.
    #[error("snapshot of {table} failed: {message}")]
    Snapshot { table: Table, message: String },

    /// The backing store answered with a non-success status.
    #[error("{table} read returned HTTP {status}: {body}")]
    Status {
        table: Table,
        status: u16,
        body: String,
    },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A table name that the engine does not track.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A change operation that is not insert, update or delete.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The dispatcher or the feed has already shut down.
    #[error("session closed")]
    Closed,
}

/// A raw row that could not be turned into a canonical entity.
///
/// These are always recovered per row: the row is dropped and a diagnostic
/// is emitted, the rest of the batch keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    /// A required column is absent, null or empty.
    #[error("{table}: missing required field `{field}`")]
    MissingField { table: Table, field: &'static str },

    /// A column is present but has an unusable shape.
    #[error("{table}: invalid field `{field}`: {reason}")]
    InvalidField {
        table: Table,
        field: &'static str,
        reason: String,
    },

    /// A change event carried no row for the operation that needs one.
    #[error("{table}: {operation} event carried no row")]
    MissingRow { table: Table, operation: Operation },
}

impl NormalizeError {
    /// The table the offending row belongs to.
    pub fn table(&self) -> Table {
        match self {
            NormalizeError::MissingField { table, .. }
            | NormalizeError::InvalidField { table, .. }
            | NormalizeError::MissingRow { table, .. } => *table,
        }
    }
}
