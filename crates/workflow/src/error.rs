//! Error types for the operation engine.
//!
//! Errors are split by when they can happen. Configuration errors are found
//! while planning, before any side effect. Store errors come from the state
//! ledger. Per-operation failures (non-zero exit, timeout, failed validation)
//! are not errors at all: they are recorded as FAILED runs and reported.

use thiserror::Error;

/// Broad error categories, used for exit codes and user feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Fatal, pre-execution problem with the definition set
    Configuration,
    /// Another writer holds the state store
    StoreContention,
    /// The state store failed or is unusable
    Store,
    /// Operator asked for something the recorded state does not allow
    Request,
}

impl ErrorCategory {
    /// Whether retrying the same invocation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreContention)
    }

    /// Actionable advice for this category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Configuration => "Fix the operation definitions and run again",
            Self::StoreContention => "Another capstan process is writing the state store; retry later",
            Self::Store => "Check the state database path and permissions",
            Self::Request => "Check the operation id and its recorded history",
        }
    }
}

/// Problems with the definition set. Always detected before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Two definitions share an id
    #[error("duplicate operation id: {id}")]
    DuplicateOperation { id: String },

    /// A definition has an empty id
    #[error("operation definition has an empty id")]
    EmptyId,

    /// A predecessor reference names no known operation
    #[error("operation '{operation}' requires unknown operation '{missing}'")]
    MissingPredecessor { operation: String, missing: String },

    /// An operation lists itself as a predecessor
    #[error("operation '{operation}' depends on itself")]
    SelfDependency { operation: String },

    /// The dependency graph contains a cycle
    #[error("dependency cycle detected: {}", format_cycle(.path))]
    CycleDetected { path: Vec<String> },

    /// A validation check has a type the engine does not know
    #[error("operation '{operation}' declares unknown validation check type '{kind}'")]
    UnknownCheckType { operation: String, kind: String },

    /// A validation check of a known type is missing or has a malformed field
    #[error("operation '{operation}' has an invalid '{kind}' check: {reason}")]
    InvalidCheck {
        operation: String,
        kind: String,
        reason: String,
    },

    /// Duration bounds are unusable
    #[error(
        "operation '{operation}' has invalid duration: timeout {timeout_secs}s, expected {expected_secs}s"
    )]
    InvalidDuration {
        operation: String,
        expected_secs: u64,
        timeout_secs: u64,
    },

    /// A template placeholder was left unresolved after rendering
    #[error("operation '{operation}' has unresolved placeholder '{placeholder}'")]
    UnresolvedPlaceholder {
        operation: String,
        placeholder: String,
    },

    /// An id given on the command line is not in the definition set
    #[error("unknown operation: {id}")]
    UnknownOperation { id: String },

    /// Definitions differ from the ones the stored run was started with
    #[error("operation definitions changed since the recorded run (stored {stored}, current {current})")]
    DefinitionsChanged { stored: String, current: String },

    /// The definition set could not be fingerprinted
    #[error("could not fingerprint definitions: {reason}")]
    Fingerprint { reason: String },
}

fn format_cycle(path: &[String]) -> String {
    match path.first() {
        Some(first) => format!("{} -> {}", path.join(" -> "), first),
        None => String::new(),
    }
}

/// Errors raised by a state store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer holds the store
    #[error("state store busy: held by {holder}; retry later")]
    Busy { holder: String },

    /// The store was opened for reading only
    #[error("state store is open read-only")]
    ReadOnly,

    /// A run referenced by the caller does not exist
    #[error("no recorded run with sequence {seq}")]
    UnknownRun { seq: i64 },

    /// Backend failure (database, IO, encoding)
    #[error("state store error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap any backend error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }

    /// Whether this is a contention error.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (fatal, pre-execution)
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// State store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Rollback requested for an operation that never ran
    #[error("operation '{operation}' has no recorded run to roll back")]
    NothingToRollBack { operation: String },

    /// Rollback requested for an operation without rollback steps
    #[error("operation '{operation}' declares no rollback steps")]
    NoRollbackSteps { operation: String },
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) => ErrorCategory::Configuration,
            Error::Store(e) if e.is_busy() => ErrorCategory::StoreContention,
            Error::Store(_) => ErrorCategory::Store,
            Error::NothingToRollBack { .. } | Error::NoRollbackSteps { .. } => {
                ErrorCategory::Request
            }
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
