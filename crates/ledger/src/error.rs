//! Error types for the ledger crate

use rusqlite::ErrorCode;
use std::path::PathBuf;
use thiserror::Error;
use workflow::StoreError;

/// Errors that can occur while opening or using a ledger
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored JSON column could not be encoded or decoded
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Another process holds the writer lease
    #[error("state store busy: held by {holder}; retry later")]
    Busy { holder: String },

    /// Opened read-only, but asked to write
    #[error("state store is open read-only")]
    ReadOnly,

    /// State database does not exist
    #[error("state database does not exist: {}", .0.display())]
    NotFound(PathBuf),

    /// Database written by a newer capstan
    #[error("state database schema v{found} is newer than supported v{supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    /// A stored value could not be parsed back
    #[error("corrupt {column} value: {value}")]
    Corrupt { column: &'static str, value: String },

    /// A referenced run does not exist
    #[error("no recorded run with sequence {0}")]
    UnknownRun(i64),
}

impl Error {
    pub(crate) fn corrupt(column: &'static str, value: impl Into<String>) -> Self {
        Self::Corrupt {
            column,
            value: value.into(),
        }
    }

    /// Whether SQLite itself reported lock contention.
    pub fn is_contention(&self) -> bool {
        match self {
            Self::Busy { .. } => true,
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            _ => false,
        }
    }
}

impl From<Error> for StoreError {
    fn from(err: Error) -> Self {
        match err {
            Error::Busy { holder } => StoreError::Busy { holder },
            Error::ReadOnly => StoreError::ReadOnly,
            Error::UnknownRun(seq) => StoreError::UnknownRun { seq },
            other if other.is_contention() => StoreError::Busy {
                holder: "another connection (database locked)".to_string(),
            },
            other => StoreError::backend(other),
        }
    }
}

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;
