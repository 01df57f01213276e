//! Single-writer lease.
//!
//! A writer owns the one row of the `lease` table for as long as its store is
//! open. A second writer fails fast instead of interleaving. A lease left by a
//! dead process on this host is reclaimed.

use crate::error::{Error, Result};
use crate::{from_ms, now_ms};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use std::fmt;

/// Current lease holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseInfo {
    pub holder: String,
    pub host: String,
    pub pid: i64,
    pub acquired_at: DateTime<Utc>,
}

impl LeaseInfo {
    /// Whether the holder is a process on this host that no longer exists.
    pub fn is_stale(&self) -> bool {
        self.host == hostname() && !process_alive(self.pid)
    }
}

impl fmt::Display for LeaseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pid {} on {} since {}",
            self.pid,
            self.host,
            self.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Unique holder token for this open store.
pub(crate) fn new_token() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{}:{}:{nanos:x}", hostname(), std::process::id())
}

/// Take the lease for `token` or fail with [`Error::Busy`].
pub(crate) fn acquire(conn: &mut Connection, token: &str) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(existing) = read(&tx)? {
        if existing.is_stale() {
            log::warn!("Reclaiming stale state lease held by {existing}");
            tx.execute("DELETE FROM lease WHERE id = 1", [])?;
        } else {
            return Err(Error::Busy {
                holder: existing.to_string(),
            });
        }
    }

    tx.execute(
        "INSERT INTO lease (id, holder, host, pid, acquired_at) VALUES (1, ?1, ?2, ?3, ?4)",
        params![token, hostname(), i64::from(std::process::id()), now_ms()],
    )?;
    tx.commit()?;
    log::debug!("Acquired state lease {token}");
    Ok(())
}

/// Give the lease back if `token` still holds it.
pub(crate) fn release(conn: &Connection, token: &str) -> Result<bool> {
    let removed = conn.execute("DELETE FROM lease WHERE id = 1 AND holder = ?1", params![token])?;
    Ok(removed > 0)
}

/// Remove whatever lease exists. Returns the lease that was broken.
pub(crate) fn break_lease(conn: &Connection) -> Result<Option<LeaseInfo>> {
    let existing = read(conn)?;
    if existing.is_some() {
        conn.execute("DELETE FROM lease WHERE id = 1", [])?;
    }
    Ok(existing)
}

pub(crate) fn read(conn: &Connection) -> Result<Option<LeaseInfo>> {
    let row = conn
        .query_row(
            "SELECT holder, host, pid, acquired_at FROM lease WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;

    Ok(row.map(|(holder, host, pid, acquired_at)| LeaseInfo {
        holder,
        host,
        pid,
        acquired_at: from_ms(acquired_at),
    }))
}

#[cfg(unix)]
pub(crate) fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(not(unix))]
pub(crate) fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(unix)]
pub(crate) fn process_alive(pid: i64) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs existence and permission checks only
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub(crate) fn process_alive(_pid: i64) -> bool {
    true
}
