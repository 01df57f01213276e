//! Compensating actions for a single operation.
//!
//! Rollback runs only the operation's own steps, in declared order. It never
//! cascades into predecessors and never stops early: every step runs even
//! after an earlier one fails.

use crate::context::{ActionRunner, ProgressCallback};
use crate::record::{
    RollbackOutcome, RollbackRecord, RollbackStepResult, RollbackTrigger, StepOutcome, millis,
};
use crate::types::{OperationDefinition, RollbackStep};
use chrono::Utc;
use std::time::Instant;

/// Run the rollback steps of `def` for `attempt`.
///
/// Returns `None` when the operation declares no steps.
pub fn roll_back(
    def: &OperationDefinition,
    attempt: u32,
    trigger: RollbackTrigger,
    runner: &dyn ActionRunner,
    progress: &mut dyn ProgressCallback,
) -> Option<RollbackRecord> {
    if def.rollback.is_empty() {
        log::debug!("{} declares no rollback steps", def.id);
        return None;
    }

    log::info!(
        "Rolling back {} (attempt {attempt}, {} steps, {})",
        def.id,
        def.rollback.len(),
        trigger.as_str()
    );
    let started_at = Utc::now();
    let mut steps = Vec::with_capacity(def.rollback.len());

    for (index, step) in def.rollback.iter().enumerate() {
        let result = run_step(def, index, step, runner);
        match result.outcome {
            StepOutcome::Succeeded => {
                log::info!("Rollback step '{}' of {} succeeded", step.name, def.id);
            }
            StepOutcome::Tolerated => log::warn!(
                "Rollback step '{}' of {} failed (tolerated): {}",
                step.name,
                def.id,
                result.error.as_deref().unwrap_or_default()
            ),
            StepOutcome::Failed => log::error!(
                "Rollback step '{}' of {} failed: {}",
                step.name,
                def.id,
                result.error.as_deref().unwrap_or_default()
            ),
        }
        progress.on_rollback_step(&def.id, &result);
        steps.push(result);
    }

    let outcome = if steps.iter().any(|s| s.outcome == StepOutcome::Failed) {
        RollbackOutcome::Incomplete
    } else {
        RollbackOutcome::Completed
    };

    Some(RollbackRecord {
        operation_id: def.id.clone(),
        attempt,
        trigger,
        started_at,
        completed_at: Utc::now(),
        steps,
        outcome,
    })
}

fn run_step(
    def: &OperationDefinition,
    index: usize,
    step: &RollbackStep,
    runner: &dyn ActionRunner,
) -> RollbackStepResult {
    let timeout = step.timeout.unwrap_or(def.duration.timeout);
    let started = Instant::now();

    let (exit_code, error, duration) = match runner.run(&step.action, timeout) {
        Ok(output) if output.success() => (output.exit_code, None, output.duration),
        Ok(output) if output.timed_out => (
            None,
            Some(format!("timed out after {}s", timeout.as_secs())),
            output.duration,
        ),
        Ok(output) => (
            output.exit_code,
            Some(output.failure_text().trim().to_string()),
            output.duration,
        ),
        Err(e) => (None, Some(format!("{e:#}")), started.elapsed()),
    };

    let outcome = match (&error, step.continue_on_error) {
        (None, _) => StepOutcome::Succeeded,
        (Some(_), true) => StepOutcome::Tolerated,
        (Some(_), false) => StepOutcome::Failed,
    };

    RollbackStepResult {
        index,
        name: step.name.clone(),
        command: step.action.command.clone(),
        continue_on_error: step.continue_on_error,
        outcome,
        exit_code,
        error,
        duration_ms: millis(duration),
    }
}
