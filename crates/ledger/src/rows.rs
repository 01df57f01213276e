//! Row mapping between SQLite and workflow records.

use crate::error::Error;
use crate::from_ms;
use rusqlite::Row;
use rusqlite::types::Type;
use workflow::{
    FailureKind, OperationRun, RollbackOutcome, RollbackRecord, RollbackTrigger, RunStatus, Session,
    SessionKind, SessionOutcome,
};

pub const RUN_COLUMNS: &str = "seq, operation_id, attempt, status, started_at, completed_at, \
     exit_code, error_message, failure_kind, error_class, retry_count, rolled_back, \
     out_of_order, duration_ms, checkpoint_seq";

pub const SESSION_COLUMNS: &str = "id, kind, fingerprint, started_at, ended_at, outcome, detail";

pub const ROLLBACK_COLUMNS: &str = "operation_id, attempt, cause, started_at, completed_at, outcome, steps";

fn conversion(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parsed<T>(
    row: &Row<'_>,
    idx: usize,
    column: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse(&text).ok_or_else(|| conversion(idx, Error::corrupt(column, text)))
}

fn parsed_opt<T>(
    row: &Row<'_>,
    idx: usize,
    column: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => parse(&text)
            .map(Some)
            .ok_or_else(|| conversion(idx, Error::corrupt(column, text))),
        None => Ok(None),
    }
}

fn json_opt<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| conversion(idx, e)),
        None => Ok(None),
    }
}

/// Map a row selected with [`RUN_COLUMNS`].
pub fn run(row: &Row<'_>) -> rusqlite::Result<OperationRun> {
    Ok(OperationRun {
        seq: row.get(0)?,
        operation_id: row.get(1)?,
        attempt: row.get(2)?,
        status: parsed(row, 3, "status", RunStatus::parse)?,
        started_at: from_ms(row.get(4)?),
        completed_at: row.get::<_, Option<i64>>(5)?.map(from_ms),
        exit_code: row.get(6)?,
        error_message: row.get(7)?,
        failure_kind: parsed_opt(row, 8, "failure_kind", FailureKind::parse)?,
        error_class: json_opt(row, 9)?,
        retry_count: row.get(10)?,
        rolled_back: row.get(11)?,
        out_of_order: row.get(12)?,
        duration_ms: row.get::<_, i64>(13)?.max(0) as u64,
        checkpoint_seq: row.get::<_, i64>(14)?.max(0) as u64,
    })
}

/// Map a row selected with [`SESSION_COLUMNS`].
pub fn session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        kind: parsed(row, 1, "kind", SessionKind::parse)?,
        fingerprint: row.get(2)?,
        started_at: from_ms(row.get(3)?),
        ended_at: row.get::<_, Option<i64>>(4)?.map(from_ms),
        outcome: parsed_opt(row, 5, "outcome", SessionOutcome::parse)?,
        detail: row.get(6)?,
    })
}

/// Map a row selected with [`ROLLBACK_COLUMNS`].
pub fn rollback(row: &Row<'_>) -> rusqlite::Result<RollbackRecord> {
    let steps: String = row.get(6)?;
    Ok(RollbackRecord {
        operation_id: row.get(0)?,
        attempt: row.get(1)?,
        trigger: parsed(row, 2, "cause", RollbackTrigger::parse)?,
        started_at: from_ms(row.get(3)?),
        completed_at: from_ms(row.get(4)?),
        outcome: parsed(row, 5, "outcome", RollbackOutcome::parse)?,
        steps: serde_json::from_str(&steps).map_err(|e| conversion(6, e))?,
    })
}
