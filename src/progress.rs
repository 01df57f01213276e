//! Terminal progress for engine runs.

use crate::ui;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use workflow::{OperationRun, ProgressCallback, RollbackStepResult, RunStatus, StepOutcome};

/// Spinner per running operation plus one result line each.
pub struct TerminalProgress {
    quiet: bool,
    total: usize,
    index: usize,
    spinner: Option<ProgressBar>,
}

impl TerminalProgress {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            total: 0,
            index: 0,
            spinner: None,
        }
    }

    fn counter(&self) -> String {
        let width = self.total.to_string().len();
        format!("[{:>width$}/{}]", self.index, self.total)
    }

    fn clear(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }

    fn line(&mut self, text: &str) {
        self.clear();
        if !self.quiet {
            println!("{text}");
        }
    }
}

impl ProgressCallback for TerminalProgress {
    fn on_plan(&mut self, order: &[String]) {
        self.total = order.len();
        self.index = 0;
        if !self.quiet {
            ui::info(&format!("{} operation(s) in order", order.len()));
        }
    }

    fn on_operation_start(&mut self, id: &str, name: &str) {
        self.clear();
        self.index += 1;
        if self.quiet {
            return;
        }
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.blue.bold} {msg} {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_prefix(self.counter());
        spinner.set_message(format!("{id} {}", name.dimmed()));
        spinner.enable_steady_tick(Duration::from_millis(100));
        self.spinner = Some(spinner);
    }

    fn on_probe(&mut self, id: &str, satisfied: bool) {
        if let Some(spinner) = &self.spinner {
            let msg = if satisfied {
                format!("{id} already in place")
            } else {
                format!("{id} executing")
            };
            spinner.set_message(msg);
        }
    }

    fn on_operation_complete(&mut self, run: &OperationRun) {
        let mark = match run.status {
            RunStatus::Succeeded => "✓".green(),
            RunStatus::SkippedIdempotent => "=".cyan(),
            RunStatus::Failed => "✗".red(),
            _ => "•".normal(),
        };
        let mut text = format!(
            "{} {mark} {} {} {}",
            self.counter().blue().bold(),
            run.operation_id,
            ui::status_label(run.status, 0),
            ui::format_duration(run.duration_ms).dimmed()
        );
        if let Some(message) = &run.error_message {
            text.push_str(&format!("\n      {}", ui::truncate(message, 100).red()));
        }
        self.line(&text);
    }

    fn on_rollback_step(&mut self, id: &str, step: &RollbackStepResult) {
        let outcome = match step.outcome {
            StepOutcome::Succeeded => "ok".green(),
            StepOutcome::Tolerated => "failed (tolerated)".yellow(),
            StepOutcome::Failed => "failed".red(),
        };
        self.line(&format!(
            "      {} {id} rollback step {}: {} {outcome}",
            "↺".magenta(),
            step.index + 1,
            step.name
        ));
    }

    fn on_blocked(&mut self, id: &str, by: &str) {
        self.line(&format!("      {} {id} blocked by {by}", "⊘".yellow()));
    }
}

impl Drop for TerminalProgress {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_is_aligned() {
        let mut progress = TerminalProgress::new(true);
        progress.on_plan(&(0..12).map(|i| i.to_string()).collect::<Vec<_>>());
        progress.on_operation_start("a", "A");
        assert_eq!(progress.counter(), "[ 1/12]");
    }

    #[test]
    fn test_quiet_progress_keeps_no_spinner() {
        let mut progress = TerminalProgress::new(true);
        progress.on_plan(&["a".to_string()]);
        progress.on_operation_start("a", "A");
        assert!(progress.spinner.is_none());
        progress.on_blocked("b", "a");
    }
}
