//! `capstan unlock`

use crate::Context;
use crate::cli::UnlockArgs;
use crate::ui;
use anyhow::{Context as _, Result};
use ledger::SqliteStore;

pub fn run(ctx: &Context, args: UnlockArgs) -> Result<u8> {
    let path = ctx.state_path()?;
    if !path.exists() {
        ui::info(&format!("No state database at {}", path.display()));
        return Ok(0);
    }

    let Some(lease) = SqliteStore::lease_info(&path)
        .with_context(|| format!("Could not read lease of {}", path.display()))?
    else {
        ui::success("State store is not locked");
        return Ok(0);
    };

    ui::kv("Held by", &lease.to_string());
    if lease.is_stale() {
        ui::dim("The holder process no longer exists");
    } else {
        ui::warn("The holder may still be running; breaking its lease lets two writers interleave");
    }

    if !args.yes && !super::confirm("Break the lease?")? {
        ui::info("Lease kept");
        return Ok(0);
    }

    match SqliteStore::break_lease(&path)? {
        Some(broken) => ui::success(&format!("Broke lease held by {broken}")),
        None => ui::info("Lease was already released"),
    }
    Ok(0)
}
