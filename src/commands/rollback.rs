//! `capstan rollback <operation>`

use crate::Context;
use crate::cli::RollbackArgs;
use crate::progress::TerminalProgress;
use crate::runner::ShellRunner;
use crate::{state, ui};
use anyhow::Result;
use workflow::{Engine, SessionKind, StepOutcome};

pub fn run(ctx: &Context, args: RollbackArgs) -> Result<u8> {
    let discovery = super::discovery(ctx);
    let plan = super::load_plan(ctx, discovery.as_ref(), Some(SessionKind::Rollback))?;
    let def = plan
        .get(&args.operation)
        .map_err(|err| super::config_failure(ctx, Some(SessionKind::Rollback), err))?;

    if !ctx.quiet {
        ui::header(&format!("Rollback {}", def.id));
        for (i, step) in def.rollback.iter().enumerate() {
            let tolerated = if step.continue_on_error {
                " (may fail)"
            } else {
                ""
            };
            println!("  {}. {}{tolerated}", i + 1, step.name);
        }
        println!();
    }

    if !args.yes
        && !super::confirm(&format!(
            "Run {} rollback step(s) for {}?",
            def.rollback.len(),
            def.id
        ))?
    {
        ui::info("Rollback cancelled");
        return Ok(0);
    }

    let runner = ShellRunner::from_config(&ctx.config.runner);
    let mut store = state::open_writer(&ctx.state_path()?)?;
    let mut progress = TerminalProgress::new(ctx.quiet);

    let report = Engine::new(&mut store, &runner)
        .with_discovery(discovery.as_ref())
        .with_progress(&mut progress)
        .rollback(&plan, &def.id)?;
    drop(progress);
    store.close()?;

    println!();
    if report.record.is_complete() {
        ui::success(&format!(
            "Rolled back {} (now {})",
            def.id, report.run.status
        ));
        if report.run.status == workflow::RunStatus::RolledBack {
            ui::dim("The operation will run again on the next resume");
        }
        Ok(0)
    } else {
        let failed: Vec<&str> = report
            .record
            .steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Failed)
            .map(|s| s.name.as_str())
            .collect();
        ui::error(&format!(
            "Rollback of {} is incomplete; failed: {}",
            def.id,
            failed.join(", ")
        ));
        ui::dim("Clean up the remaining resources by hand");
        Ok(1)
    }
}
