//! `capstan history`

use crate::Context;
use crate::cli::HistoryArgs;
use crate::{state, ui};
use anyhow::Result;
use colored::Colorize;
use workflow::{OperationRun, Session, SessionOutcome, StateStore};

const RECENT_SESSIONS: usize = 10;

pub fn run(ctx: &Context, args: HistoryArgs) -> Result<u8> {
    let path = ctx.state_path()?;
    let Some(store) = state::open_reader(&path)? else {
        ui::info(&format!("No state recorded yet at {}", path.display()));
        return Ok(0);
    };

    let runs = match &args.operation {
        Some(id) => store.runs_for(id)?,
        None => store.all_runs()?,
    };

    if args.operation.is_none() {
        let sessions = store.sessions()?;
        print_sessions(&sessions);
    }

    let skip = runs.len().saturating_sub(args.limit);
    print_runs(&runs[skip..], skip);
    Ok(0)
}

fn print_sessions(sessions: &[Session]) {
    ui::header("Sessions");
    if sessions.is_empty() {
        ui::dim("No sessions recorded");
        return;
    }
    let skip = sessions.len().saturating_sub(RECENT_SESSIONS);
    for session in &sessions[skip..] {
        let outcome = match session.outcome {
            Some(SessionOutcome::Succeeded) => "succeeded".green(),
            Some(SessionOutcome::Degraded) => "degraded".yellow(),
            Some(outcome) => outcome.as_str().red(),
            None => "running or interrupted".dimmed(),
        };
        let detail = session
            .detail
            .as_deref()
            .map(|d| ui::truncate(d, 80))
            .unwrap_or_default();
        println!(
            "  #{:<4} {}  {:<8}  {outcome}  {}",
            session.id,
            session.started_at.format("%Y-%m-%d %H:%M:%S"),
            session.kind.as_str(),
            detail.dimmed()
        );
    }
}

fn print_runs(runs: &[OperationRun], skipped: usize) {
    ui::header("Attempts");
    if runs.is_empty() {
        ui::dim("No attempts recorded");
        return;
    }
    if skipped > 0 {
        ui::dim(&format!("{skipped} earlier attempt(s) not shown"));
    }

    let width = ui::column_width(runs.iter().map(|r| r.operation_id.as_str()), 9);
    for run in runs {
        let mut flags = Vec::new();
        if run.out_of_order {
            flags.push("out of order".to_string());
        }
        if run.rolled_back {
            flags.push("rolled back".to_string());
        }
        if let Some(class) = &run.error_class {
            flags.push(class.category.clone());
        }
        println!(
            "  {:>5}  {}  {:<width$}  #{:<3} {}  {:>8}  {}",
            run.checkpoint_seq,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.operation_id,
            run.attempt,
            ui::status_label(run.status, 18),
            ui::format_duration(run.duration_ms),
            flags.join(", ").dimmed()
        );
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cli::RunArgs;
    use crate::commands::fixtures::{Workspace, bash_op};

    #[test]
    fn test_history_without_state() {
        let ws = Workspace::new();
        let ctx = ws.context();
        let args = HistoryArgs {
            operation: None,
            limit: 10,
        };
        assert_eq!(run(&ctx, args).unwrap(), 0);
    }

    #[test]
    fn test_history_after_run() {
        let ws = Workspace::new();
        ws.op("networking", "rg", &bash_op("rg", "networking", &[], "true"));
        let ctx = ws.context();
        crate::commands::run::run(
            &ctx,
            RunArgs {
                operation: None,
                dry_run: false,
                capability: None,
            },
        )
        .unwrap();

        let args = HistoryArgs {
            operation: Some("rg".to_string()),
            limit: 1,
        };
        assert_eq!(run(&ctx, args).unwrap(), 0);
    }
}
