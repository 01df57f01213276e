//! State store abstraction and the in-memory implementation.
//!
//! The store is the durable ledger of operation runs and the only shared
//! mutable resource. Every write must be durable before the call returns and
//! must advance the store's checkpoint sequence.

use crate::error::{ConfigError, StoreError};
use crate::record::{
    OperationRun, RollbackRecord, RunContext, RunOutcome, RunStatus, millis,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// What kind of invocation a session records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Run,
    Resume,
    /// `run <id>`, out of band
    Single,
    Rollback,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Resume => "resume",
            Self::Single => "single",
            Self::Rollback => "rollback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run" => Some(Self::Run),
            "resume" => Some(Self::Resume),
            "single" => Some(Self::Single),
            "rollback" => Some(Self::Rollback),
            _ => None,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Succeeded,
    Halted,
    Degraded,
    ConfigError,
    /// The invocation stopped on a store or runner error
    Aborted,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Halted => "halted",
            Self::Degraded => "degraded",
            Self::ConfigError => "config_error",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(Self::Succeeded),
            "halted" => Some(Self::Halted),
            "degraded" => Some(Self::Degraded),
            "config_error" => Some(Self::ConfigError),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One engine invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub kind: SessionKind,
    pub fingerprint: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<SessionOutcome>,
    pub detail: Option<String>,
}

/// Durable ledger of operation runs.
///
/// Implementations hold a single-writer lease for as long as they are open.
pub trait StateStore {
    /// Open a session row for an invocation.
    fn begin_session(
        &mut self,
        kind: SessionKind,
        fingerprint: Option<&str>,
    ) -> StoreResult<Session>;

    /// Close a session row.
    fn end_session(
        &mut self,
        session: &Session,
        outcome: SessionOutcome,
        detail: Option<&str>,
    ) -> StoreResult<()>;

    fn sessions(&self) -> StoreResult<Vec<Session>>;

    /// Fingerprint of the definitions the deployment was run with.
    fn fingerprint(&self) -> StoreResult<Option<String>>;

    fn set_fingerprint(&mut self, fingerprint: &str) -> StoreResult<()>;

    /// Append an IN_PROGRESS attempt.
    ///
    /// The store assigns the attempt number and counts earlier failures into
    /// `retry_count`.
    fn record_start(&mut self, operation_id: &str, context: RunContext)
    -> StoreResult<OperationRun>;

    /// Append a zero-duration SKIPPED_IDEMPOTENT attempt.
    fn record_skipped(&mut self, operation_id: &str) -> StoreResult<OperationRun>;

    /// Finish an attempt started with [`StateStore::record_start`].
    fn record_result(
        &mut self,
        run: &OperationRun,
        outcome: &RunOutcome,
    ) -> StoreResult<OperationRun>;

    /// Annotate an attempt as rolled back, optionally overriding its status.
    fn mark_rolled_back(
        &mut self,
        run: &OperationRun,
        status: Option<RunStatus>,
    ) -> StoreResult<OperationRun>;

    /// Latest attempt of an operation.
    fn latest_run(&self, operation_id: &str) -> StoreResult<Option<OperationRun>>;

    /// Every attempt, ordered by checkpoint.
    fn all_runs(&self) -> StoreResult<Vec<OperationRun>>;

    fn record_rollback(&mut self, record: &RollbackRecord) -> StoreResult<()>;

    fn rollback_records(&self, operation_id: &str) -> StoreResult<Vec<RollbackRecord>>;

    /// Current checkpoint sequence; zero for an empty store.
    fn checkpoint(&self) -> StoreResult<u64>;

    /// Whether the latest attempt of an operation is terminal-success.
    fn is_terminal_success(&self, operation_id: &str) -> StoreResult<bool> {
        Ok(self
            .latest_run(operation_id)?
            .is_some_and(|r| r.status.is_terminal_success()))
    }

    /// Every attempt of one operation, oldest first.
    fn runs_for(&self, operation_id: &str) -> StoreResult<Vec<OperationRun>> {
        Ok(self
            .all_runs()?
            .into_iter()
            .filter(|r| r.operation_id == operation_id)
            .collect())
    }

    /// Record a session that stopped on a configuration error.
    fn record_config_failure(
        &mut self,
        kind: SessionKind,
        error: &ConfigError,
    ) -> StoreResult<()> {
        let session = self.begin_session(kind, None)?;
        self.end_session(&session, SessionOutcome::ConfigError, Some(&error.to_string()))
    }
}

/// Store kept in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: Vec<OperationRun>,
    rollbacks: Vec<RollbackRecord>,
    sessions: Vec<Session>,
    fingerprint: Option<String>,
    checkpoint: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&mut self) -> u64 {
        self.checkpoint += 1;
        self.checkpoint
    }

    fn next_attempt(&self, operation_id: &str) -> (u32, u32) {
        let prior = self.runs.iter().filter(|r| r.operation_id == operation_id);
        let attempt = prior.clone().map(|r| r.attempt).max().unwrap_or(0) + 1;
        let failures = prior.filter(|r| r.status == RunStatus::Failed).count();
        (attempt, u32::try_from(failures).unwrap_or(u32::MAX))
    }

    fn append(&mut self, operation_id: &str, status: RunStatus, context: RunContext) -> OperationRun {
        let (attempt, retry_count) = self.next_attempt(operation_id);
        let now = Utc::now();
        let checkpoint_seq = self.tick();
        let run = OperationRun {
            seq: i64::try_from(self.runs.len()).unwrap_or(i64::MAX) + 1,
            operation_id: operation_id.to_string(),
            attempt,
            status,
            started_at: now,
            completed_at: (status != RunStatus::InProgress).then_some(now),
            exit_code: None,
            error_message: None,
            failure_kind: None,
            error_class: None,
            retry_count,
            rolled_back: false,
            out_of_order: context.out_of_order,
            duration_ms: 0,
            checkpoint_seq,
        };
        self.runs.push(run.clone());
        run
    }

    fn row_mut(&mut self, seq: i64) -> StoreResult<&mut OperationRun> {
        self.runs
            .iter_mut()
            .find(|r| r.seq == seq)
            .ok_or(StoreError::UnknownRun { seq })
    }
}

impl StateStore for MemoryStore {
    fn begin_session(
        &mut self,
        kind: SessionKind,
        fingerprint: Option<&str>,
    ) -> StoreResult<Session> {
        self.tick();
        let session = Session {
            id: i64::try_from(self.sessions.len()).unwrap_or(i64::MAX) + 1,
            kind,
            fingerprint: fingerprint.map(str::to_string),
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            detail: None,
        };
        self.sessions.push(session.clone());
        Ok(session)
    }

    fn end_session(
        &mut self,
        session: &Session,
        outcome: SessionOutcome,
        detail: Option<&str>,
    ) -> StoreResult<()> {
        self.tick();
        if let Some(row) = self.sessions.iter_mut().find(|s| s.id == session.id) {
            row.ended_at = Some(Utc::now());
            row.outcome = Some(outcome);
            row.detail = detail.map(str::to_string);
        }
        Ok(())
    }

    fn sessions(&self) -> StoreResult<Vec<Session>> {
        Ok(self.sessions.clone())
    }

    fn fingerprint(&self) -> StoreResult<Option<String>> {
        Ok(self.fingerprint.clone())
    }

    fn set_fingerprint(&mut self, fingerprint: &str) -> StoreResult<()> {
        self.tick();
        self.fingerprint = Some(fingerprint.to_string());
        Ok(())
    }

    fn record_start(
        &mut self,
        operation_id: &str,
        context: RunContext,
    ) -> StoreResult<OperationRun> {
        Ok(self.append(operation_id, RunStatus::InProgress, context))
    }

    fn record_skipped(&mut self, operation_id: &str) -> StoreResult<OperationRun> {
        Ok(self.append(operation_id, RunStatus::SkippedIdempotent, RunContext::gated()))
    }

    fn record_result(
        &mut self,
        run: &OperationRun,
        outcome: &RunOutcome,
    ) -> StoreResult<OperationRun> {
        let checkpoint_seq = self.tick();
        let row = self.row_mut(run.seq)?;
        row.status = outcome.status;
        row.completed_at = Some(Utc::now());
        row.exit_code = outcome.exit_code;
        row.error_message.clone_from(&outcome.error_message);
        row.failure_kind = outcome.failure_kind;
        row.error_class.clone_from(&outcome.error_class);
        row.duration_ms = millis(outcome.duration);
        row.checkpoint_seq = checkpoint_seq;
        Ok(row.clone())
    }

    fn mark_rolled_back(
        &mut self,
        run: &OperationRun,
        status: Option<RunStatus>,
    ) -> StoreResult<OperationRun> {
        let checkpoint_seq = self.tick();
        let row = self.row_mut(run.seq)?;
        row.rolled_back = true;
        if let Some(status) = status {
            row.status = status;
        }
        row.checkpoint_seq = checkpoint_seq;
        Ok(row.clone())
    }

    fn latest_run(&self, operation_id: &str) -> StoreResult<Option<OperationRun>> {
        Ok(self
            .runs
            .iter()
            .filter(|r| r.operation_id == operation_id)
            .max_by_key(|r| r.attempt)
            .cloned())
    }

    fn all_runs(&self) -> StoreResult<Vec<OperationRun>> {
        let mut runs = self.runs.clone();
        runs.sort_by_key(|r| r.checkpoint_seq);
        Ok(runs)
    }

    fn record_rollback(&mut self, record: &RollbackRecord) -> StoreResult<()> {
        self.tick();
        self.rollbacks.push(record.clone());
        Ok(())
    }

    fn rollback_records(&self, operation_id: &str) -> StoreResult<Vec<RollbackRecord>> {
        Ok(self
            .rollbacks
            .iter()
            .filter(|r| r.operation_id == operation_id)
            .cloned()
            .collect())
    }

    fn checkpoint(&self) -> StoreResult<u64> {
        Ok(self.checkpoint)
    }
}
