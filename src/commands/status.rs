//! `capstan status`

use crate::Context;
use crate::cli::StatusArgs;
use crate::{state, ui};
use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use workflow::{
    MemoryStore, OperationRun, Plan, RollbackRecord, StateStore, StatusReport, StepOutcome,
};

/// Every recorded attempt and rollback of one operation.
#[derive(Debug, Serialize)]
struct OperationDetail<'a> {
    operation_id: &'a str,
    name: &'a str,
    capability: &'a str,
    requires: Vec<&'a str>,
    position: Option<usize>,
    runs: Vec<OperationRun>,
    rollbacks: Vec<RollbackRecord>,
}

pub fn run(ctx: &Context, args: StatusArgs) -> Result<u8> {
    let discovery = super::discovery(ctx);
    let plan = super::load_plan(ctx, discovery.as_ref(), None)?;

    let path = ctx.state_path()?;
    let recorded = state::open_reader(&path)?;
    let empty = MemoryStore::new();
    let store: &dyn StateStore = match &recorded {
        Some(store) => store,
        None => &empty,
    };

    if let Some(id) = &args.operation {
        return show_operation(&plan, store, id, args.json);
    }

    let report = workflow::status(&plan, store)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(0);
    }

    print_table(&report);
    print_footer(&report, &path.display().to_string());
    Ok(0)
}

fn print_table(report: &StatusReport) {
    ui::header("Operation Status");
    let width = ui::column_width(report.entries.iter().map(|e| e.operation_id.as_str()), 9);
    let cap_width = ui::column_width(report.entries.iter().map(|e| e.capability.as_str()), 10);

    for entry in &report.entries {
        let mut note = Vec::new();
        if let Some(run) = &entry.latest {
            if run.duration_ms > 0 {
                note.push(ui::format_duration(run.duration_ms));
            }
            if entry.attempts > 1 {
                note.push(format!("{} attempts", entry.attempts));
            }
            if run.rolled_back {
                note.push("rolled back".to_string());
            }
            if run.out_of_order {
                note.push("out of order".to_string());
            }
            if let Some(kind) = run.failure_kind {
                note.push(kind.as_str().to_string());
            }
        }
        println!(
            "  {:<width$}  {:<cap_width$}  {}  {}",
            entry.operation_id,
            entry.capability.dimmed(),
            ui::status_label(entry.status(), 18),
            note.join(", ").dimmed()
        );
        if let Some(message) = entry.latest.as_ref().and_then(|r| r.error_message.as_deref()) {
            println!("  {:<width$}  {}", "", ui::truncate(message, 100).red());
        }
    }
}

fn print_footer(report: &StatusReport, path: &str) {
    println!();
    ui::kv("State", path);
    ui::kv("Checkpoint", &report.checkpoint.to_string());
    match &report.stored_fingerprint {
        Some(_) if report.fingerprint_matches => ui::kv("Definitions", &"unchanged".green().to_string()),
        Some(_) => ui::kv(
            "Definitions",
            &"changed since the recorded run; resume will refuse".yellow().to_string(),
        ),
        None => ui::kv("Definitions", "no run recorded"),
    }

    println!();
    if report.is_complete() {
        ui::success("Every operation is in place");
    } else if let Some(point) = &report.resume_point {
        if report.has_failures() {
            ui::warn(&format!("Resume would start at {point}"));
        } else {
            ui::info(&format!("Next operation: {point}"));
        }
    }
}

fn show_operation(plan: &Plan, store: &dyn StateStore, id: &str, json: bool) -> Result<u8> {
    let def = plan.get(id)?;
    let detail = OperationDetail {
        operation_id: &def.id,
        name: &def.name,
        capability: &def.capability,
        requires: plan.graph().predecessors(&def.id).map(String::as_str).collect(),
        position: plan.position(&def.id).map(|p| p + 1),
        runs: store.runs_for(&def.id)?,
        rollbacks: store.rollback_records(&def.id)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(0);
    }

    ui::header(&format!("{} ({})", detail.operation_id, detail.name));
    ui::kv("Capability", detail.capability);
    if let Some(position) = detail.position {
        ui::kv("Position", &format!("{position} of {}", plan.len()));
    }
    ui::kv(
        "Requires",
        &if detail.requires.is_empty() {
            "nothing".to_string()
        } else {
            detail.requires.join(", ")
        },
    );
    ui::kv("Rollback steps", &def.rollback.len().to_string());

    ui::section("Attempts");
    if detail.runs.is_empty() {
        ui::dim("No attempts recorded");
    }
    for run in &detail.runs {
        let mut flags = Vec::new();
        if run.retry_count > 0 {
            flags.push(format!("retry {}", run.retry_count));
        }
        if run.out_of_order {
            flags.push("out of order".to_string());
        }
        if run.rolled_back {
            flags.push("rolled back".to_string());
        }
        println!(
            "  #{:<3} {}  {}  {:>8}  {}",
            run.attempt,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            ui::status_label(run.status, 18),
            ui::format_duration(run.duration_ms),
            flags.join(", ").dimmed()
        );
        if let Some(message) = &run.error_message {
            println!("        {}", ui::truncate(message, 100).red());
        }
        if let Some(class) = &run.error_class {
            let advice = class.advice.as_deref().unwrap_or("");
            println!("        {} {}", class.category.yellow(), advice.dimmed());
        }
    }

    if !detail.rollbacks.is_empty() {
        ui::section("Rollbacks");
        for record in &detail.rollbacks {
            println!(
                "  attempt #{} {} rollback {}: {}",
                record.attempt,
                record.trigger.as_str(),
                record.completed_at.format("%Y-%m-%d %H:%M:%S"),
                record.outcome.as_str()
            );
            for step in &record.steps {
                let mark = match step.outcome {
                    StepOutcome::Succeeded => "✓".green(),
                    StepOutcome::Tolerated => "~".yellow(),
                    StepOutcome::Failed => "✗".red(),
                };
                println!("    {mark} {}. {}", step.index + 1, step.name);
            }
        }
    }
    Ok(0)
}
