//! Opening the state database for commands.

use anyhow::{Context, Result};
use ledger::SqliteStore;
use std::path::Path;

/// Open the state database for writing, taking the writer lease.
pub fn open_writer(path: &Path) -> Result<SqliteStore> {
    let store = SqliteStore::open(path)
        .with_context(|| format!("Could not open state database {}", path.display()))?;
    log::debug!("Opened state database {} for writing", path.display());
    Ok(store)
}

/// Open the state database for reading. `None` when nothing was recorded yet.
pub fn open_reader(path: &Path) -> Result<Option<SqliteStore>> {
    if !path.exists() {
        log::debug!("No state database at {}", path.display());
        return Ok(None);
    }
    let store = SqliteStore::open_read_only(path)
        .with_context(|| format!("Could not read state database {}", path.display()))?;
    Ok(Some(store))
}

// ============================================================================
// Tests
// ============================================================================
