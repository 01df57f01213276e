//! `capstan run` and `capstan resume`.

use crate::Context;
use crate::cli::RunArgs;
use crate::progress::TerminalProgress;
use crate::runner::ShellRunner;
use crate::{state, ui};
use anyhow::Result;
use colored::Colorize;
use workflow::{
    Disposition, Engine, MemoryStore, Plan, ProbeResult, RunReport, SessionKind, Verdict,
};

pub fn run(ctx: &Context, args: RunArgs) -> Result<u8> {
    let kind = if args.operation.is_some() {
        SessionKind::Single
    } else {
        SessionKind::Run
    };
    let discovery = super::discovery(ctx);
    let mut plan = super::load_plan(ctx, discovery.as_ref(), Some(kind))?;

    if let Some(capability) = &args.capability {
        plan = plan
            .restrict_to_capability(capability)
            .map_err(|err| super::config_failure(ctx, Some(kind), err))?;
    }

    let runner = ShellRunner::from_config(&ctx.config.runner);

    if args.dry_run {
        return dry_run(ctx, &plan, &runner, discovery.as_ref());
    }

    let classifier = super::classifier(ctx)?;
    let mut store = state::open_writer(&ctx.state_path()?)?;
    let mut progress = TerminalProgress::new(ctx.quiet);

    let report = {
        let mut engine = Engine::new(&mut store, &runner)
            .with_discovery(discovery.as_ref())
            .with_classifier(&classifier)
            .with_progress(&mut progress);
        match &args.operation {
            Some(id) => engine.run_operation(&plan, id)?,
            None => engine.run(&plan)?,
        }
    };
    drop(progress);
    store.close()?;

    print_report(&report);
    Ok(exit_status(&report))
}

pub fn resume(ctx: &Context) -> Result<u8> {
    let discovery = super::discovery(ctx);
    let plan = super::load_plan(ctx, discovery.as_ref(), Some(SessionKind::Resume))?;

    let runner = ShellRunner::from_config(&ctx.config.runner);
    let classifier = super::classifier(ctx)?;
    let mut store = state::open_writer(&ctx.state_path()?)?;
    let mut progress = TerminalProgress::new(ctx.quiet);

    let report = Engine::new(&mut store, &runner)
        .with_discovery(discovery.as_ref())
        .with_classifier(&classifier)
        .with_progress(&mut progress)
        .resume(&plan)?;
    drop(progress);
    store.close()?;

    print_report(&report);
    Ok(exit_status(&report))
}

fn exit_status(report: &RunReport) -> u8 {
    u8::try_from(report.exit_code()).unwrap_or(1)
}

/// Probe every operation against discovery and show what a run would do.
fn dry_run(
    ctx: &Context,
    plan: &Plan,
    runner: &ShellRunner,
    discovery: &dyn workflow::Discovery,
) -> Result<u8> {
    let mut store = MemoryStore::new();
    let preview = Engine::new(&mut store, runner)
        .with_discovery(discovery)
        .preview(plan);

    ui::header("Dry Run");
    let width = ui::column_width(preview.iter().map(|p| p.operation_id.as_str()), 9);
    let mut would_execute = 0;
    for (i, entry) in preview.iter().enumerate() {
        let verdict = match &entry.probe {
            Some(ProbeResult::Satisfied) => "skip, already in place".cyan(),
            Some(ProbeResult::NotSatisfied) => "execute".green(),
            Some(ProbeResult::Unavailable(reason)) => {
                format!("execute (probe unavailable: {})", ui::truncate(reason, 60)).yellow()
            }
            None => "execute (no probe)".green(),
        };
        if entry.would_execute() {
            would_execute += 1;
        }
        println!(
            "  {:>3}. {:<width$}  {:<12}  {verdict}",
            i + 1,
            entry.operation_id,
            entry.capability.dimmed()
        );
    }

    println!();
    ui::info(&format!(
        "{would_execute} of {} operation(s) would execute; nothing was changed",
        preview.len()
    ));
    if !ctx.quiet && would_execute > 0 {
        ui::dim("Run without --dry-run to apply");
    }
    Ok(0)
}

/// Summary table after a run or resume.
pub fn print_report(report: &RunReport) {
    ui::header("Summary");
    if let Some(from) = &report.resumed_from {
        ui::kv("Resumed from", from);
    }

    let width = ui::column_width(report.entries.iter().map(|e| e.operation_id.as_str()), 9);
    for entry in &report.entries {
        let (label, note) = match (&entry.disposition, &entry.run) {
            (Disposition::Executed, Some(run)) => {
                let mut note = ui::format_duration(run.duration_ms);
                if let Some(class) = &run.error_class {
                    note.push_str(&format!(", {}", class.category));
                }
                if run.rolled_back {
                    note.push_str(", rolled back");
                }
                (ui::status_label(run.status, 18), note)
            }
            (Disposition::Carried, Some(run)) => {
                (ui::status_label(run.status, 18), "from an earlier run".to_string())
            }
            (Disposition::Blocked { by }, _) => {
                (format!("{:<18}", "BLOCKED").yellow(), format!("by {by}"))
            }
            _ => (format!("{:<18}", "NOT RUN").dimmed(), String::new()),
        };
        println!(
            "  {:<width$}  {label}  {}",
            entry.operation_id,
            note.dimmed()
        );
        if let Some(run) = &entry.run
            && matches!(entry.disposition, Disposition::Executed)
        {
            if let Some(message) = &run.error_message {
                println!("  {:<width$}  {}", "", ui::truncate(message, 100).red());
            }
            if let Some(advice) = run.error_class.as_ref().and_then(|c| c.advice.as_deref()) {
                println!("  {:<width$}  {}", "", advice.yellow());
            }
        }
    }

    println!();
    let executed = report
        .entries
        .iter()
        .filter(|e| matches!(e.disposition, Disposition::Executed))
        .count();
    match report.verdict {
        Verdict::Succeeded => ui::success(&format!(
            "All {} operation(s) in place ({executed} executed this time)",
            report.entries.len()
        )),
        Verdict::Degraded => {
            let blocked = report.blocked().count();
            ui::warn(&format!(
                "Finished with failures that allow continuing; {blocked} operation(s) blocked"
            ));
        }
        Verdict::Halted => {
            let by = report.halted_by.as_deref().unwrap_or("an operation");
            ui::error(&format!("Halted by {by}"));
            ui::dim("Fix the cause, then continue with `capstan resume`");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
