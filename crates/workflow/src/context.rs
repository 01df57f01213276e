//! Provider traits for the engine's external collaborators.
//!
//! The engine never spawns processes, reads inventories or prints anything
//! itself. Callers plug those in through these traits, and tests substitute
//! in-process doubles.

use crate::record::{ErrorClass, OperationRun, RollbackStepResult};
use crate::types::RenderedAction;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Captured result of running a rendered action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    /// Exit code; `None` when killed by a signal or after a timeout
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// The action was killed after exceeding its timeout
    pub timed_out: bool,
}

impl ActionOutput {
    /// Output of a process that exited with `code`.
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// Output of a process killed after `after`.
    pub fn timeout(after: Duration) -> Self {
        Self {
            duration: after,
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Whether the action exited 0 within its timeout.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// The most useful failure text: stderr, falling back to stdout.
    pub fn failure_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Executes rendered actions.
///
/// Implementations must enforce `timeout` and kill the action when it
/// expires, reporting `timed_out`. An `Err` means the action could not be
/// started at all.
pub trait ActionRunner: Send + Sync {
    fn run(&self, action: &RenderedAction, timeout: Duration) -> Result<ActionOutput>;
}

/// A live resource as seen by discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// A discovered fact: `dependent` needs `dependency` to exist first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub dependent: crate::types::ResourceRef,
    pub dependency: crate::types::ResourceRef,
    #[serde(default)]
    pub kind: String,
}

/// Read-only resource lookups.
pub trait Discovery: Send + Sync {
    /// Find a resource. `Ok(None)` means it does not exist.
    fn lookup(
        &self,
        resource_type: &str,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Option<ResourceRecord>>;

    /// Resource-level dependency facts.
    fn relationships(&self) -> Result<Vec<Relationship>> {
        Ok(Vec::new())
    }

    /// Forget anything remembered about a resource, so the next lookup asks
    /// the source again.
    fn invalidate(&self, _resource_type: &str, _name: &str, _scope: Option<&str>) {}
}

/// Discovery that knows nothing. Every lookup fails.
pub struct NoDiscovery;

impl Discovery for NoDiscovery {
    fn lookup(
        &self,
        resource_type: &str,
        name: &str,
        _scope: Option<&str>,
    ) -> Result<Option<ResourceRecord>> {
        anyhow::bail!("no discovery source configured (lookup of {resource_type}/{name})")
    }
}

/// Maps a failed action's output to an error class.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, output: &ActionOutput) -> Option<ErrorClass>;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&ActionOutput) -> Option<ErrorClass> + Send + Sync,
{
    fn classify(&self, output: &ActionOutput) -> Option<ErrorClass> {
        self(output)
    }
}

/// Classifier that never classifies.
pub struct NoClassifier;

impl ErrorClassifier for NoClassifier {
    fn classify(&self, _output: &ActionOutput) -> Option<ErrorClass> {
        None
    }
}

/// Progress callback for engine runs
///
/// Implement this trait to render progress while operations execute.
pub trait ProgressCallback: Send {
    /// Called once with the order about to be walked
    fn on_plan(&mut self, order: &[String]);

    /// Called when an operation enters its protocol
    fn on_operation_start(&mut self, id: &str, name: &str);

    /// Called after an idempotency probe
    fn on_probe(&mut self, id: &str, satisfied: bool);

    /// Called with the final record of an attempt
    fn on_operation_complete(&mut self, run: &OperationRun);

    /// Called after each rollback step
    fn on_rollback_step(&mut self, id: &str, step: &RollbackStepResult);

    /// Called for an operation that cannot start because `by` did not succeed
    fn on_blocked(&mut self, id: &str, by: &str);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_plan(&mut self, _order: &[String]) {}
    fn on_operation_start(&mut self, _id: &str, _name: &str) {}
    fn on_probe(&mut self, _id: &str, _satisfied: bool) {}
    fn on_operation_complete(&mut self, _run: &OperationRun) {}
    fn on_rollback_step(&mut self, _id: &str, _step: &RollbackStepResult) {}
    fn on_blocked(&mut self, _id: &str, _by: &str) {}
}
