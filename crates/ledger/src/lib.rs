//! # Ledger
//!
//! Durable state store for workflow runs, backed by SQLite.
//!
//! This crate provides:
//! - A [`workflow::StateStore`] implementation where every write commits
//!   durably (WAL, `synchronous=FULL`) before returning
//! - A single-writer lease: a second writer fails fast with `Busy`
//! - Versioned schema migrations
//!
//! ## Example
//!
//! ```no_run
//! use ledger::SqliteStore;
//! use std::path::Path;
//! use workflow::StateStore;
//!
//! let store = SqliteStore::open(Path::new("/var/lib/capstan/state.db"))?;
//! for run in store.all_runs()? {
//!     println!("{} attempt {}: {}", run.operation_id, run.attempt, run.status);
//! }
//! store.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
mod lease;
mod rows;
mod schema;

pub use error::{Error, Result};
pub use lease::LeaseInfo;
pub use schema::SCHEMA_VERSION;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::time::Duration;
use workflow::{
    OperationRun, RollbackRecord, RunContext, RunOutcome, RunStatus, Session, SessionKind,
    SessionOutcome, StateStore, StoreError, StoreResult,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// A state database bound to one invocation
///
/// Opening for writing takes the writer lease; [`SqliteStore::close`] (or
/// drop) gives it back.
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
    /// Lease token; `None` when opened read-only or after close
    token: Option<String>,
}

impl SqliteStore {
    /// Open or create a state database and take the writer lease
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = connect(path)?;
        let token = lease::new_token();
        lease::acquire(&mut conn, &token).map_err(busy)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            token: Some(token),
        })
    }

    /// Open an existing database without taking the lease
    ///
    /// Every write fails with [`Error::ReadOnly`].
    pub fn open_read_only(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        // No CREATE flag; writes are refused by the missing lease token
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let version = schema::current_version(&conn)?;
        if version > SCHEMA_VERSION {
            return Err(Error::SchemaTooNew {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            token: None,
        })
    }

    /// Release the lease and close the database
    pub fn close(mut self) -> Result<()> {
        if let Some(token) = self.token.take() {
            lease::release(&self.conn, &token)?;
            log::debug!("Released state lease {token}");
        }
        Ok(())
    }

    /// Remove the writer lease of a database, whoever holds it
    pub fn break_lease(path: &Path) -> Result<Option<LeaseInfo>> {
        let conn = connect(path)?;
        let broken = lease::break_lease(&conn)?;
        if let Some(info) = &broken {
            log::warn!("Broke state lease held by {info}");
        }
        Ok(broken)
    }

    /// Current writer lease of a database, if any
    pub fn lease_info(path: &Path) -> Result<Option<LeaseInfo>> {
        if !path.exists() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        lease::read(&conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.token.is_none()
    }

    /// Run `f` in an immediate transaction with a fresh checkpoint
    fn write<T>(&mut self, f: impl FnOnce(&Transaction<'_>, u64) -> Result<T>) -> Result<T> {
        let Some(token) = self.token.as_deref() else {
            return Err(Error::ReadOnly);
        };
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| busy(e.into()))?;

        match lease::read(&tx)? {
            Some(held) if held.holder == token => {}
            Some(held) => {
                return Err(Error::Busy {
                    holder: held.to_string(),
                });
            }
            None => {
                return Err(Error::Busy {
                    holder: "nobody (lease was broken)".to_string(),
                });
            }
        }

        tx.execute(
            "UPDATE meta SET value = CAST(value AS INTEGER) + 1 WHERE key = 'checkpoint_seq'",
            [],
        )?;
        let seq = checkpoint(&tx)?;
        let value = f(&tx, seq)?;
        tx.commit()?;
        Ok(value)
    }

    fn insert_run(
        &mut self,
        operation_id: &str,
        status: RunStatus,
        context: RunContext,
    ) -> Result<OperationRun> {
        self.write(|tx, seq| {
            let (attempt, retry_count): (u32, u32) = tx.query_row(
                "SELECT COALESCE(MAX(attempt), 0) + 1,
                        COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0)
                 FROM operation_runs WHERE operation_id = ?1",
                params![operation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let now = now_ms();
            let completed_at = (status != RunStatus::InProgress).then_some(now);
            tx.execute(
                "INSERT INTO operation_runs
                     (operation_id, attempt, status, started_at, completed_at, retry_count,
                      out_of_order, duration_ms, checkpoint_seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
                params![
                    operation_id,
                    attempt,
                    status.as_str(),
                    now,
                    completed_at,
                    retry_count,
                    context.out_of_order,
                    seq as i64
                ],
            )?;
            select_run(tx, tx.last_insert_rowid())
        })
    }

    fn query_runs(&self, sql: &str, operation_id: Option<&str>) -> Result<Vec<OperationRun>> {
        let mut stmt = self.conn.prepare(sql)?;
        let runs = match operation_id {
            Some(id) => stmt.query_map(params![id], rows::run)?.collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt.query_map([], rows::run)?.collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(runs)
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = lease::release(&self.conn, &token) {
                log::warn!("Could not release state lease {token}: {e}");
            }
        }
    }
}

fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    log::debug!("Opened {} (journal_mode={mode})", path.display());
    conn.pragma_update(None, "synchronous", "FULL")?;
    schema::migrate(&conn)?;
    Ok(conn)
}

/// Report SQLite lock contention as a busy store.
fn busy(err: Error) -> Error {
    if err.is_contention() && !matches!(err, Error::Busy { .. }) {
        Error::Busy {
            holder: "another connection (database locked)".to_string(),
        }
    } else {
        err
    }
}

fn checkpoint(conn: &Connection) -> Result<u64> {
    let value: i64 = conn.query_row(
        "SELECT CAST(value AS INTEGER) FROM meta WHERE key = 'checkpoint_seq'",
        [],
        |row| row.get(0),
    )?;
    Ok(value.max(0) as u64)
}

fn select_run(conn: &Connection, seq: i64) -> Result<OperationRun> {
    let sql = format!("SELECT {} FROM operation_runs WHERE seq = ?1", rows::RUN_COLUMNS);
    conn.query_row(&sql, params![seq], rows::run)
        .optional()?
        .ok_or(Error::UnknownRun(seq))
}

impl StateStore for SqliteStore {
    fn begin_session(
        &mut self,
        kind: SessionKind,
        fingerprint: Option<&str>,
    ) -> StoreResult<Session> {
        let started = now_ms();
        let id = self.write(|tx, _| {
            tx.execute(
                "INSERT INTO sessions (kind, fingerprint, started_at) VALUES (?1, ?2, ?3)",
                params![kind.as_str(), fingerprint, started],
            )?;
            Ok(tx.last_insert_rowid())
        })?;
        Ok(Session {
            id,
            kind,
            fingerprint: fingerprint.map(str::to_string),
            started_at: from_ms(started),
            ended_at: None,
            outcome: None,
            detail: None,
        })
    }

    fn end_session(
        &mut self,
        session: &Session,
        outcome: SessionOutcome,
        detail: Option<&str>,
    ) -> StoreResult<()> {
        self.write(|tx, _| {
            tx.execute(
                "UPDATE sessions SET ended_at = ?2, outcome = ?3, detail = ?4 WHERE id = ?1",
                params![session.id, now_ms(), outcome.as_str(), detail],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn sessions(&self) -> StoreResult<Vec<Session>> {
        let sql = format!("SELECT {} FROM sessions ORDER BY id", rows::SESSION_COLUMNS);
        let inner = || -> Result<Vec<Session>> {
            let mut stmt = self.conn.prepare(&sql)?;
            let sessions = stmt
                .query_map([], rows::session)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sessions)
        };
        Ok(inner()?)
    }

    fn fingerprint(&self) -> StoreResult<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'fingerprint'", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(Error::from)?;
        Ok(value)
    }

    fn set_fingerprint(&mut self, fingerprint: &str) -> StoreResult<()> {
        self.write(|tx, _| {
            tx.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('fingerprint', ?1)",
                params![fingerprint],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn record_start(
        &mut self,
        operation_id: &str,
        context: RunContext,
    ) -> StoreResult<OperationRun> {
        Ok(self.insert_run(operation_id, RunStatus::InProgress, context)?)
    }

    fn record_skipped(&mut self, operation_id: &str) -> StoreResult<OperationRun> {
        Ok(self.insert_run(operation_id, RunStatus::SkippedIdempotent, RunContext::gated())?)
    }

    fn record_result(
        &mut self,
        run: &OperationRun,
        outcome: &RunOutcome,
    ) -> StoreResult<OperationRun> {
        let class = outcome
            .error_class
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(Error::from)?;
        let updated = self.write(|tx, seq| {
            let changed = tx.execute(
                "UPDATE operation_runs
                 SET status = ?2, completed_at = ?3, exit_code = ?4, error_message = ?5,
                     failure_kind = ?6, error_class = ?7, duration_ms = ?8, checkpoint_seq = ?9
                 WHERE seq = ?1",
                params![
                    run.seq,
                    outcome.status.as_str(),
                    now_ms(),
                    outcome.exit_code,
                    outcome.error_message,
                    outcome.failure_kind.map(|k| k.as_str()),
                    class,
                    workflow::record::millis(outcome.duration) as i64,
                    seq as i64
                ],
            )?;
            if changed == 0 {
                return Err(Error::UnknownRun(run.seq));
            }
            select_run(tx, run.seq)
        })?;
        Ok(updated)
    }

    fn mark_rolled_back(
        &mut self,
        run: &OperationRun,
        status: Option<RunStatus>,
    ) -> StoreResult<OperationRun> {
        let updated = self.write(|tx, seq| {
            let changed = tx.execute(
                "UPDATE operation_runs
                 SET rolled_back = 1, status = COALESCE(?2, status), checkpoint_seq = ?3
                 WHERE seq = ?1",
                params![run.seq, status.map(|s| s.as_str()), seq as i64],
            )?;
            if changed == 0 {
                return Err(Error::UnknownRun(run.seq));
            }
            select_run(tx, run.seq)
        })?;
        Ok(updated)
    }

    fn latest_run(&self, operation_id: &str) -> StoreResult<Option<OperationRun>> {
        let sql = format!(
            "SELECT {} FROM operation_runs WHERE operation_id = ?1 ORDER BY attempt DESC LIMIT 1",
            rows::RUN_COLUMNS
        );
        Ok(self.query_runs(&sql, Some(operation_id))?.pop())
    }

    fn all_runs(&self) -> StoreResult<Vec<OperationRun>> {
        let sql = format!(
            "SELECT {} FROM operation_runs ORDER BY checkpoint_seq, seq",
            rows::RUN_COLUMNS
        );
        Ok(self.query_runs(&sql, None)?)
    }

    fn runs_for(&self, operation_id: &str) -> StoreResult<Vec<OperationRun>> {
        let sql = format!(
            "SELECT {} FROM operation_runs WHERE operation_id = ?1 ORDER BY attempt",
            rows::RUN_COLUMNS
        );
        Ok(self.query_runs(&sql, Some(operation_id))?)
    }

    fn record_rollback(&mut self, record: &RollbackRecord) -> StoreResult<()> {
        let steps = serde_json::to_string(&record.steps).map_err(Error::from)?;
        self.write(|tx, _| {
            tx.execute(
                "INSERT INTO rollback_records
                     (operation_id, attempt, cause, started_at, completed_at, outcome, steps)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.operation_id,
                    record.attempt,
                    record.trigger.as_str(),
                    record.started_at.timestamp_millis(),
                    record.completed_at.timestamp_millis(),
                    record.outcome.as_str(),
                    steps
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn rollback_records(&self, operation_id: &str) -> StoreResult<Vec<RollbackRecord>> {
        let sql = format!(
            "SELECT {} FROM rollback_records WHERE operation_id = ?1 ORDER BY id",
            rows::ROLLBACK_COLUMNS
        );
        let inner = || -> Result<Vec<RollbackRecord>> {
            let mut stmt = self.conn.prepare(&sql)?;
            let records = stmt
                .query_map(params![operation_id], rows::rollback)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        };
        Ok(inner()?)
    }

    fn checkpoint(&self) -> StoreResult<u64> {
        Ok(checkpoint(&self.conn)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use workflow::{
        ErrorClass, FailureKind, RollbackOutcome, RollbackStepResult, RollbackTrigger, StepOutcome,
    };

    fn db_path(dir: &TempDir) -> PathBuf {
        dir.path().join("state").join("state.db")
    }

    #[test]
    fn test_open_creates_database() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        let store = SqliteStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(!store.is_read_only());
        assert_eq!(store.checkpoint().unwrap(), 0);
        assert!(store.fingerprint().unwrap().is_none());
        store.close().unwrap();
    }

    #[test]
    fn test_second_writer_is_busy() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        let first = SqliteStore::open(&path).unwrap();

        let err = SqliteStore::open(&path).err().unwrap();
        assert!(matches!(err, Error::Busy { .. }));
        assert!(err.is_contention());
        let store_err: StoreError = err.into();
        assert!(store_err.is_busy());

        first.close().unwrap();
        SqliteStore::open(&path).unwrap();
    }

    #[test]
    fn test_drop_releases_lease() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        {
            let _store = SqliteStore::open(&path).unwrap();
            assert!(SqliteStore::lease_info(&path).unwrap().is_some());
        }
        assert!(SqliteStore::lease_info(&path).unwrap().is_none());
    }

    #[test]
    fn test_break_lease_stops_the_old_writer() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        let mut stale = SqliteStore::open(&path).unwrap();

        let broken = SqliteStore::break_lease(&path).unwrap().unwrap();
        assert_eq!(broken.pid, i64::from(std::process::id()));

        let err = stale.set_fingerprint("abc").unwrap_err();
        assert!(err.is_busy());
    }

    #[test]
    fn test_runs_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);

        let mut store = SqliteStore::open(&path).unwrap();
        store.set_fingerprint("f00d").unwrap();
        let run = store.record_start("vnet", RunContext::gated()).unwrap();
        let failed = store
            .record_result(
                &run,
                &RunOutcome::failed(
                    FailureKind::Execution,
                    Some(1),
                    "ERROR: (QuotaExceeded) cores",
                    Duration::from_millis(2500),
                )
                .with_class(Some(ErrorClass {
                    category: "quota".into(),
                    retryable: false,
                    destructive: false,
                    advice: Some("request a quota increase".into()),
                })),
            )
            .unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        let marked = store.mark_rolled_back(&failed, None).unwrap();
        assert!(marked.rolled_back);
        assert_eq!(marked.status, RunStatus::Failed);
        store.close().unwrap();

        let store = SqliteStore::open_read_only(&path).unwrap();
        assert_eq!(store.fingerprint().unwrap().as_deref(), Some("f00d"));
        let latest = store.latest_run("vnet").unwrap().unwrap();
        assert_eq!(latest.attempt, 1);
        assert_eq!(latest.duration_ms, 2500);
        assert_eq!(latest.exit_code, Some(1));
        assert_eq!(latest.failure_kind, Some(FailureKind::Execution));
        assert_eq!(latest.error_class.unwrap().category, "quota");
        assert!(latest.rolled_back);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        SqliteStore::open(&path).unwrap().close().unwrap();

        let mut store = SqliteStore::open_read_only(&path).unwrap();
        assert!(store.is_read_only());
        assert!(matches!(
            store.record_start("a", RunContext::gated()),
            Err(StoreError::ReadOnly)
        ));
        assert!(matches!(
            SqliteStore::open_read_only(&dir.path().join("missing.db")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_attempts_retry_counts_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let mut store = SqliteStore::open(&db_path(&dir)).unwrap();

        let first = store.record_start("kv", RunContext::gated()).unwrap();
        store
            .record_result(
                &first,
                &RunOutcome::failed(FailureKind::Timeout, None, "timed out after 30s", Duration::from_secs(30)),
            )
            .unwrap();
        let second = store.record_start("kv", RunContext::out_of_order()).unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.retry_count, 1);
        assert!(second.out_of_order);
        store
            .record_result(&second, &RunOutcome::succeeded(Some(0), Duration::from_secs(3)))
            .unwrap();
        let skipped = store.record_skipped("kv").unwrap();
        assert_eq!(skipped.attempt, 3);
        assert_eq!(skipped.status, RunStatus::SkippedIdempotent);
        assert!(skipped.completed_at.is_some());

        let runs = store.all_runs().unwrap();
        assert_eq!(runs.len(), 3);
        let seqs: Vec<u64> = runs.iter().map(|r| r.checkpoint_seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(store.checkpoint().unwrap(), *seqs.last().unwrap());
        assert!(store.is_terminal_success("kv").unwrap());
        assert_eq!(store.runs_for("kv").unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_run() {
        let dir = TempDir::new().unwrap();
        let mut store = SqliteStore::open(&db_path(&dir)).unwrap();
        let mut run = store.record_start("a", RunContext::gated()).unwrap();
        run.seq = 404;
        let err = store
            .record_result(&run, &RunOutcome::succeeded(Some(0), Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownRun { seq: 404 }));
    }

    #[test]
    fn test_sessions_and_rollback_records() {
        let dir = TempDir::new().unwrap();
        let mut store = SqliteStore::open(&db_path(&dir)).unwrap();

        let session = store.begin_session(SessionKind::Resume, Some("abc")).unwrap();
        store
            .end_session(&session, SessionOutcome::Halted, Some("vm failed"))
            .unwrap();
        let sessions = store.sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].kind, SessionKind::Resume);
        assert_eq!(sessions[0].outcome, Some(SessionOutcome::Halted));
        assert_eq!(sessions[0].detail.as_deref(), Some("vm failed"));

        let record = RollbackRecord {
            operation_id: "vm".into(),
            attempt: 1,
            trigger: RollbackTrigger::Automatic,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            steps: vec![RollbackStepResult {
                index: 0,
                name: "delete-nic".into(),
                command: "az network nic delete -g rg -n web-nic".into(),
                continue_on_error: true,
                outcome: StepOutcome::Tolerated,
                exit_code: Some(3),
                error: Some("NicInUse".into()),
                duration_ms: 812,
            }],
            outcome: RollbackOutcome::Completed,
        };
        store.record_rollback(&record).unwrap();

        let stored = store.rollback_records("vm").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].steps, record.steps);
        assert_eq!(stored[0].trigger, RollbackTrigger::Automatic);
        assert!(store.rollback_records("other").unwrap().is_empty());
    }
}
