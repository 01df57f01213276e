//! Run records: what the state store persists about each attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle status of one operation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    SkippedIdempotent,
    /// Operator rolled back a previously successful run
    RolledBack,
}

impl RunStatus {
    /// Whether dependents may start after this status.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::SkippedIdempotent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::SkippedIdempotent => "SKIPPED_IDEMPOTENT",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "SKIPPED_IDEMPOTENT" => Some(Self::SkippedIdempotent),
            "ROLLED_BACK" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Non-zero exit or the action could not be started
    Execution,
    /// The action exceeded its hard timeout and was killed
    Timeout,
    /// Exit 0, but a post-condition did not hold
    Validation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "execution" => Some(Self::Execution),
            "timeout" => Some(Self::Timeout),
            "validation" => Some(Self::Validation),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed action's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClass {
    pub category: String,
    #[serde(default)]
    pub retryable: bool,
    /// Fixing this likely needs a destructive change (delete and recreate)
    #[serde(default)]
    pub destructive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<String>,
}

/// One attempt of one operation, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRun {
    /// Store-assigned row id
    pub seq: i64,
    pub operation_id: String,
    /// 1-based attempt number per operation
    pub attempt: u32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub error_class: Option<ErrorClass>,
    /// Failed attempts recorded before this one
    pub retry_count: u32,
    /// Rollback steps ran to completion for this attempt
    pub rolled_back: bool,
    /// Started outside dependency gating
    pub out_of_order: bool,
    pub duration_ms: u64,
    /// Store checkpoint of the last write to this row
    pub checkpoint_seq: u64,
}

impl OperationRun {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Options for starting an attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunContext {
    /// Started outside dependency gating (single out-of-band run)
    pub out_of_order: bool,
}

impl RunContext {
    pub fn gated() -> Self {
        Self::default()
    }

    pub fn out_of_order() -> Self {
        Self { out_of_order: true }
    }
}

/// Final result of an attempt, handed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub error_class: Option<ErrorClass>,
    pub duration: Duration,
}

impl RunOutcome {
    pub fn succeeded(exit_code: Option<i32>, duration: Duration) -> Self {
        Self {
            status: RunStatus::Succeeded,
            exit_code,
            error_message: None,
            failure_kind: None,
            error_class: None,
            duration,
        }
    }

    pub fn failed(
        kind: FailureKind,
        exit_code: Option<i32>,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            status: RunStatus::Failed,
            exit_code,
            error_message: Some(message.into()),
            failure_kind: Some(kind),
            error_class: None,
            duration,
        }
    }

    pub fn with_class(mut self, class: Option<ErrorClass>) -> Self {
        self.error_class = class;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

/// What started a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    /// Failure handling inside a run
    Automatic,
    /// Operator `rollback <id>`
    Manual,
}

impl RollbackTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "automatic" => Some(Self::Automatic),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    /// Failed, but the step allows failure
    Tolerated,
}

/// Result of one compensating step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackStepResult {
    pub index: usize,
    pub name: String,
    /// Verbatim action text
    pub command: String,
    pub continue_on_error: bool,
    pub outcome: StepOutcome,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    Completed,
    /// At least one step failed without tolerance
    Incomplete,
}

impl RollbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "incomplete" => Some(Self::Incomplete),
            _ => None,
        }
    }
}

/// Ordered log of compensating steps for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub operation_id: String,
    pub attempt: u32,
    pub trigger: RollbackTrigger,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub steps: Vec<RollbackStepResult>,
    pub outcome: RollbackOutcome,
}

impl RollbackRecord {
    pub fn is_complete(&self) -> bool {
        self.outcome == RollbackOutcome::Completed
    }
}

/// Convert a duration to whole milliseconds, saturating.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
