//! Schema migrations.

use crate::error::{Error, Result};
use crate::now_ms;
use rusqlite::{Connection, params};

/// Newest schema version this build understands.
pub const SCHEMA_VERSION: i64 = 1;

const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "initial",
    "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS lease (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        holder TEXT NOT NULL,
        host TEXT NOT NULL,
        pid INTEGER NOT NULL,
        acquired_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        fingerprint TEXT,
        started_at INTEGER NOT NULL,
        ended_at INTEGER,
        outcome TEXT,
        detail TEXT
    );

    CREATE TABLE IF NOT EXISTS operation_runs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        operation_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        status TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        completed_at INTEGER,
        exit_code INTEGER,
        error_message TEXT,
        failure_kind TEXT,
        error_class TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        rolled_back INTEGER NOT NULL DEFAULT 0,
        out_of_order INTEGER NOT NULL DEFAULT 0,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        checkpoint_seq INTEGER NOT NULL,
        UNIQUE (operation_id, attempt)
    );

    CREATE INDEX IF NOT EXISTS idx_runs_operation ON operation_runs(operation_id);
    CREATE INDEX IF NOT EXISTS idx_runs_checkpoint ON operation_runs(checkpoint_seq);

    CREATE TABLE IF NOT EXISTS rollback_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        operation_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        cause TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        completed_at INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        steps TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_rollbacks_operation ON rollback_records(operation_id, attempt);

    INSERT OR IGNORE INTO meta (key, value) VALUES ('checkpoint_seq', '0');
    ",
)];

/// Bring the database up to [`SCHEMA_VERSION`].
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );
        ",
    )?;

    let current = current_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(Error::SchemaTooNew {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    for (version, name, sql) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        log::debug!("Applying state schema migration v{version} ({name})");
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![version, name, now_ms()],
        )?;
    }
    Ok(())
}

/// Highest applied migration, zero for a fresh database.
pub fn current_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, 1);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (99, 'future', 0)",
            [],
        )
        .unwrap();
        assert!(matches!(
            migrate(&conn),
            Err(Error::SchemaTooNew { found: 99, .. })
        ));
    }
}
