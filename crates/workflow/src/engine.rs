//! Execution engine
//!
//! Walks a [`Plan`] in order. For each operation: idempotency probe, execute,
//! validate, record, and roll back on failure. Exactly one operation runs at a
//! time and every transition is written to the [`StateStore`] before the next
//! one starts.

use crate::context::{
    ActionRunner, Discovery, ErrorClassifier, NoClassifier, NoDiscovery, NoProgress,
    ProgressCallback,
};
use crate::error::{ConfigError, Error, Result};
use crate::plan::Plan;
use crate::record::{
    FailureKind, OperationRun, RollbackRecord, RollbackTrigger, RunContext, RunOutcome, RunStatus,
};
use crate::rollback::roll_back;
use crate::store::{Session, SessionKind, SessionOutcome, StateStore, StoreResult};
use crate::types::OperationDefinition;
use crate::validate::{self, ProbeResult};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Overall outcome of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every operation reached terminal success
    Succeeded,
    /// Only continue-on-error failures (and their blocked dependents)
    Degraded,
    /// A failed operation stopped the run
    Halted,
}

impl Verdict {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Halted => 1,
            Self::Degraded => 2,
        }
    }

    fn session_outcome(self) -> SessionOutcome {
        match self {
            Self::Succeeded => SessionOutcome::Succeeded,
            Self::Degraded => SessionOutcome::Degraded,
            Self::Halted => SessionOutcome::Halted,
        }
    }
}

/// What happened to an operation during an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disposition {
    /// Went through the protocol (executed or skipped by its probe)
    Executed,
    /// Already terminal-success in the store; no new run
    Carried,
    /// A predecessor did not succeed
    Blocked { by: String },
    /// The run halted before this operation
    NotReached,
}

/// One row of a run summary.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub operation_id: String,
    pub capability: String,
    pub disposition: Disposition,
    /// The new attempt, or the carried one
    pub run: Option<OperationRun>,
}

impl ReportEntry {
    pub fn status(&self) -> Option<RunStatus> {
        self.run.as_ref().map(|r| r.status)
    }
}

/// Summary of a `run`, `resume` or single-operation invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub kind: SessionKind,
    pub entries: Vec<ReportEntry>,
    pub verdict: Verdict,
    /// First operation a resume re-entered at
    pub resumed_from: Option<String>,
    /// Operation whose failure halted the run
    pub halted_by: Option<String>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    pub fn entry(&self, id: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.operation_id == id)
    }

    pub fn status_of(&self, id: &str) -> Option<RunStatus> {
        self.entry(id).and_then(ReportEntry::status)
    }

    /// Count of entries that went through the protocol with `status`.
    pub fn executed_with(&self, status: RunStatus) -> usize {
        self.entries
            .iter()
            .filter(|e| e.disposition == Disposition::Executed && e.status() == Some(status))
            .count()
    }

    pub fn blocked(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.disposition, Disposition::Blocked { .. }))
    }
}

/// Result of an operator rollback.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub run: OperationRun,
    pub record: RollbackRecord,
}

/// Stored state of one operation.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub operation_id: String,
    pub name: String,
    pub capability: String,
    pub latest: Option<OperationRun>,
    pub attempts: usize,
}

impl StatusEntry {
    pub fn status(&self) -> RunStatus {
        self.latest.as_ref().map_or(RunStatus::Pending, |r| r.status)
    }
}

/// Stored state of a whole plan.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub entries: Vec<StatusEntry>,
    pub stored_fingerprint: Option<String>,
    pub fingerprint_matches: bool,
    /// Where a resume would start
    pub resume_point: Option<String>,
    pub checkpoint: u64,
}

impl StatusReport {
    pub fn is_complete(&self) -> bool {
        self.resume_point.is_none()
    }

    pub fn has_failures(&self) -> bool {
        self.entries.iter().any(|e| e.status() == RunStatus::Failed)
    }
}

/// Dry-run view of one operation.
#[derive(Debug, Clone)]
pub struct PreviewEntry {
    pub operation_id: String,
    pub capability: String,
    /// `None` when no idempotency probe is declared
    pub probe: Option<ProbeResult>,
}

impl PreviewEntry {
    /// Whether a real run would execute the action.
    pub fn would_execute(&self) -> bool {
        !self.probe.as_ref().is_some_and(ProbeResult::is_satisfied)
    }
}

/// Read the stored state of a plan.
pub fn status<S: StateStore + ?Sized>(plan: &Plan, store: &S) -> StoreResult<StatusReport> {
    let mut latest: BTreeMap<String, OperationRun> = BTreeMap::new();
    let mut attempts: BTreeMap<String, usize> = BTreeMap::new();
    for run in store.all_runs()? {
        *attempts.entry(run.operation_id.clone()).or_default() += 1;
        let newer = latest
            .get(&run.operation_id)
            .is_none_or(|seen| run.attempt >= seen.attempt);
        if newer {
            latest.insert(run.operation_id.clone(), run);
        }
    }

    let entries: Vec<StatusEntry> = plan
        .definitions()
        .map(|def| StatusEntry {
            operation_id: def.id.clone(),
            name: def.name.clone(),
            capability: def.capability.clone(),
            latest: latest.remove(&def.id),
            attempts: attempts.get(&def.id).copied().unwrap_or(0),
        })
        .collect();

    let resume_point = entries
        .iter()
        .find(|e| !e.status().is_terminal_success())
        .map(|e| e.operation_id.clone());
    let stored_fingerprint = store.fingerprint()?;

    Ok(StatusReport {
        fingerprint_matches: stored_fingerprint
            .as_deref()
            .is_none_or(|fp| fp == plan.fingerprint()),
        stored_fingerprint,
        resume_point,
        checkpoint: store.checkpoint()?,
        entries,
    })
}

/// Drives operations through their lifecycle against one store.
pub struct Engine<'a, S: StateStore> {
    store: &'a mut S,
    runner: &'a dyn ActionRunner,
    discovery: &'a dyn Discovery,
    classifier: &'a dyn ErrorClassifier,
    progress: Option<&'a mut dyn ProgressCallback>,
    silent: NoProgress,
}

impl<'a, S: StateStore> Engine<'a, S> {
    /// Create an engine with no discovery, no classifier and no progress output.
    pub fn new(store: &'a mut S, runner: &'a dyn ActionRunner) -> Self {
        Self {
            store,
            runner,
            discovery: &NoDiscovery,
            classifier: &NoClassifier,
            progress: None,
            silent: NoProgress,
        }
    }

    pub fn with_discovery(mut self, discovery: &'a dyn Discovery) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_classifier(mut self, classifier: &'a dyn ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_progress(mut self, progress: &'a mut dyn ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    fn progress(&mut self) -> &mut dyn ProgressCallback {
        match self.progress.as_deref_mut() {
            Some(progress) => progress,
            None => &mut self.silent,
        }
    }

    /// Run the full order. Every operation is re-probed; nothing is carried.
    pub fn run(&mut self, plan: &Plan) -> Result<RunReport> {
        let session = self
            .store
            .begin_session(SessionKind::Run, Some(plan.fingerprint()))?;
        let result = self
            .store
            .set_fingerprint(plan.fingerprint())
            .map_err(Error::from)
            .and_then(|()| self.walk(plan, SessionKind::Run, 0));
        self.finish(&session, result)
    }

    /// Continue at the first operation whose latest run is not terminal-success.
    ///
    /// Rejects definitions that differ from the ones the deployment was run
    /// with. Earlier operations are never re-executed; later ones that already
    /// succeeded are carried over.
    pub fn resume(&mut self, plan: &Plan) -> Result<RunReport> {
        if let Some(stored) = self.store.fingerprint()? {
            if stored != plan.fingerprint() {
                return Err(self.reject(
                    SessionKind::Resume,
                    ConfigError::DefinitionsChanged {
                        stored,
                        current: plan.fingerprint().to_string(),
                    },
                ));
            }
        }

        let session = self
            .store
            .begin_session(SessionKind::Resume, Some(plan.fingerprint()))?;
        let result = self.resume_inner(plan);
        self.finish(&session, result)
    }

    fn resume_inner(&mut self, plan: &Plan) -> Result<RunReport> {
        self.store.set_fingerprint(plan.fingerprint())?;

        let mut start = None;
        for (index, id) in plan.order().iter().enumerate() {
            if !self.store.is_terminal_success(id)? {
                start = Some(index);
                break;
            }
        }

        let Some(start) = start else {
            log::info!("Nothing to resume: all {} operations already succeeded", plan.len());
            let mut entries = Vec::with_capacity(plan.len());
            for def in plan.definitions() {
                entries.push(self.carried(def)?);
            }
            return Ok(RunReport {
                kind: SessionKind::Resume,
                entries,
                verdict: Verdict::Succeeded,
                resumed_from: None,
                halted_by: None,
            });
        };

        log::info!("Resuming at {}", plan.order()[start]);
        let mut report = self.walk(plan, SessionKind::Resume, start)?;
        report.resumed_from = Some(plan.order()[start].clone());
        Ok(report)
    }

    /// Run one operation out of band, bypassing dependency gating.
    pub fn run_operation(&mut self, plan: &Plan, id: &str) -> Result<RunReport> {
        let def = match plan.get(id) {
            Ok(def) => def,
            Err(e) => return Err(self.reject(SessionKind::Single, e)),
        };

        let session = self
            .store
            .begin_session(SessionKind::Single, Some(plan.fingerprint()))?;
        let result = self.run_operation_inner(plan, def);
        self.finish(&session, result)
    }

    fn run_operation_inner(&mut self, plan: &Plan, def: &OperationDefinition) -> Result<RunReport> {
        if self.store.fingerprint()?.is_none() {
            self.store.set_fingerprint(plan.fingerprint())?;
        }

        let mut unmet = Vec::new();
        for pred in plan.graph().predecessors(&def.id) {
            if !self.store.is_terminal_success(pred)? {
                unmet.push(pred.as_str());
            }
        }
        if unmet.is_empty() {
            log::warn!("Running {} out of order", def.id);
        } else {
            log::warn!(
                "Running {} out of order; predecessors not succeeded: {}",
                def.id,
                unmet.join(", ")
            );
        }

        self.progress().on_plan(std::slice::from_ref(&def.id));
        let run = self.process(def, RunContext::out_of_order())?;
        let verdict = match run.status {
            RunStatus::Failed if def.continue_on_error => Verdict::Degraded,
            RunStatus::Failed => Verdict::Halted,
            _ => Verdict::Succeeded,
        };
        Ok(RunReport {
            kind: SessionKind::Single,
            halted_by: (verdict == Verdict::Halted).then(|| def.id.clone()),
            entries: vec![ReportEntry {
                operation_id: def.id.clone(),
                capability: def.capability.clone(),
                disposition: Disposition::Executed,
                run: Some(run),
            }],
            verdict,
            resumed_from: None,
        })
    }

    /// Operator rollback of an operation's latest attempt.
    ///
    /// A completed rollback of a successful run sets it to ROLLED_BACK, which
    /// makes the operation eligible for re-execution on the next resume. A
    /// failed run keeps its status and gains the rolled-back annotation.
    pub fn rollback(&mut self, plan: &Plan, id: &str) -> Result<RollbackReport> {
        let def = match plan.get(id) {
            Ok(def) => def,
            Err(e) => return Err(self.reject(SessionKind::Rollback, e)),
        };
        if def.rollback.is_empty() {
            return Err(Error::NoRollbackSteps {
                operation: def.id.clone(),
            });
        }
        let Some(run) = self.store.latest_run(&def.id)? else {
            return Err(Error::NothingToRollBack {
                operation: def.id.clone(),
            });
        };

        let session = self
            .store
            .begin_session(SessionKind::Rollback, Some(plan.fingerprint()))?;
        let result = self.rollback_inner(def, run);
        match result {
            Ok(report) => {
                let outcome = if report.record.is_complete() {
                    SessionOutcome::Succeeded
                } else {
                    SessionOutcome::Halted
                };
                self.store.end_session(&session, outcome, None)?;
                Ok(report)
            }
            Err(e) => {
                self.abort(&session, &e);
                Err(e)
            }
        }
    }

    fn rollback_inner(&mut self, def: &OperationDefinition, run: OperationRun) -> Result<RollbackReport> {
        let runner = self.runner;
        let record = roll_back(def, run.attempt, RollbackTrigger::Manual, runner, self.progress())
            .ok_or_else(|| Error::NoRollbackSteps {
                operation: def.id.clone(),
            })?;
        self.store.record_rollback(&record)?;

        let run = if record.is_complete() {
            let status = run
                .status
                .is_terminal_success()
                .then_some(RunStatus::RolledBack);
            let run = self.store.mark_rolled_back(&run, status)?;
            log::info!("Rolled back {} (status {})", def.id, run.status);
            run
        } else {
            log::error!("Rollback of {} is incomplete", def.id);
            run
        };
        Ok(RollbackReport { run, record })
    }

    /// Probe every operation without executing anything.
    pub fn preview(&mut self, plan: &Plan) -> Vec<PreviewEntry> {
        plan.definitions()
            .map(|def| PreviewEntry {
                operation_id: def.id.clone(),
                capability: def.capability.clone(),
                probe: def.idempotency.as_ref().map(|check| {
                    validate::probe(check, self.runner, self.discovery, def.duration.timeout)
                }),
            })
            .collect()
    }

    fn walk(&mut self, plan: &Plan, kind: SessionKind, start: usize) -> Result<RunReport> {
        let carry = kind == SessionKind::Resume;
        self.progress().on_plan(plan.order());

        let mut entries = Vec::with_capacity(plan.len());
        let mut unsuccessful: BTreeSet<String> = BTreeSet::new();
        let mut halted_by: Option<String> = None;

        for (index, def) in plan.definitions().enumerate() {
            if halted_by.is_some() {
                if carry && self.store.is_terminal_success(&def.id)? {
                    entries.push(self.carried(def)?);
                    continue;
                }
                let disposition = match first_in(plan, &def.id, &unsuccessful) {
                    Some(by) => {
                        unsuccessful.insert(def.id.clone());
                        Disposition::Blocked { by }
                    }
                    None => Disposition::NotReached,
                };
                entries.push(self.entry(def, disposition, None));
                continue;
            }

            if index < start || (carry && self.store.is_terminal_success(&def.id)?) {
                log::debug!("{} already succeeded, carried over", def.id);
                entries.push(self.carried(def)?);
                continue;
            }

            if let Some(by) = self.blocker(plan, &def.id, &unsuccessful)? {
                log::warn!("{} blocked: {by} has not succeeded", def.id);
                self.progress().on_blocked(&def.id, &by);
                unsuccessful.insert(def.id.clone());
                entries.push(self.entry(def, Disposition::Blocked { by }, None));
                continue;
            }

            let run = self.process(def, RunContext::gated())?;
            if run.status == RunStatus::Failed {
                unsuccessful.insert(def.id.clone());
                if def.continue_on_error {
                    log::warn!("{} failed; continuing (continue_on_error)", def.id);
                } else {
                    log::error!("{} failed; halting run", def.id);
                    halted_by = Some(def.id.clone());
                }
            }
            entries.push(self.entry(def, Disposition::Executed, Some(run)));
        }

        let verdict = if halted_by.is_some() {
            Verdict::Halted
        } else if unsuccessful.is_empty() {
            Verdict::Succeeded
        } else {
            Verdict::Degraded
        };

        Ok(RunReport {
            kind,
            entries,
            verdict,
            resumed_from: None,
            halted_by,
        })
    }

    /// First predecessor that failed here or is not terminal-success in the store.
    fn blocker(
        &self,
        plan: &Plan,
        id: &str,
        unsuccessful: &BTreeSet<String>,
    ) -> Result<Option<String>> {
        for pred in plan.graph().predecessors(id) {
            if unsuccessful.contains(pred) || !self.store.is_terminal_success(pred)? {
                return Ok(Some(pred.clone()));
            }
        }
        Ok(None)
    }

    fn entry(
        &self,
        def: &OperationDefinition,
        disposition: Disposition,
        run: Option<OperationRun>,
    ) -> ReportEntry {
        ReportEntry {
            operation_id: def.id.clone(),
            capability: def.capability.clone(),
            disposition,
            run,
        }
    }

    fn carried(&self, def: &OperationDefinition) -> Result<ReportEntry> {
        let run = self.store.latest_run(&def.id)?;
        Ok(self.entry(def, Disposition::Carried, run))
    }

    /// Idempotency check, execute, validate, record, roll back on failure.
    fn process(&mut self, def: &OperationDefinition, context: RunContext) -> Result<OperationRun> {
        self.progress().on_operation_start(&def.id, &def.name);

        if let Some(check) = &def.idempotency {
            let probe = validate::probe(check, self.runner, self.discovery, def.duration.timeout);
            self.progress().on_probe(&def.id, probe.is_satisfied());
            match probe {
                ProbeResult::Satisfied => {
                    let run = self.store.record_skipped(&def.id)?;
                    log::info!("{} already in goal state, skipped", def.id);
                    self.progress().on_operation_complete(&run);
                    return Ok(run);
                }
                ProbeResult::NotSatisfied => {
                    log::debug!("{} probe not satisfied, executing", def.id);
                }
                ProbeResult::Unavailable(reason) => {
                    log::warn!("{} probe could not run ({reason}); executing", def.id);
                }
            }
        }

        let run = self.store.record_start(&def.id, context)?;
        log::info!("Executing {} (attempt {})", def.id, run.attempt);

        let outcome = self.perform(def);
        let mut run = self.store.record_result(&run, &outcome)?;

        if run.status == RunStatus::Failed {
            log::error!(
                "{} failed ({}): {}",
                def.id,
                run.failure_kind.map_or("unknown", |k| k.as_str()),
                run.error_message.as_deref().unwrap_or_default().trim()
            );
            let runner = self.runner;
            if let Some(record) =
                roll_back(def, run.attempt, RollbackTrigger::Automatic, runner, self.progress())
            {
                self.store.record_rollback(&record)?;
                if record.is_complete() {
                    run = self.store.mark_rolled_back(&run, None)?;
                }
            }
        } else {
            log::info!("{} succeeded in {}ms", def.id, run.duration_ms);
        }

        self.progress().on_operation_complete(&run);
        Ok(run)
    }

    /// Run the action and its validation checks.
    fn perform(&self, def: &OperationDefinition) -> RunOutcome {
        let timeout = def.duration.timeout;
        let started = Instant::now();

        let output = match self.runner.run(&def.action, timeout) {
            Ok(output) => output,
            Err(e) => {
                return RunOutcome::failed(
                    FailureKind::Execution,
                    None,
                    format!("failed to start action: {e:#}"),
                    started.elapsed(),
                );
            }
        };

        if output.timed_out {
            return RunOutcome::failed(
                FailureKind::Timeout,
                None,
                format!("timed out after {}s", timeout.as_secs()),
                output.duration,
            )
            .with_class(self.classifier.classify(&output));
        }

        if output.exit_code != Some(0) {
            let text = output.failure_text();
            let message = if text.trim().is_empty() {
                match output.exit_code {
                    Some(code) => format!("exited with code {code}"),
                    None => "terminated by signal".to_string(),
                }
            } else {
                text.to_string()
            };
            return RunOutcome::failed(FailureKind::Execution, output.exit_code, message, output.duration)
                .with_class(self.classifier.classify(&output));
        }

        match validate::run_checks(&def.validation, &output, self.discovery, def.validation_poll) {
            Ok(()) => RunOutcome::succeeded(output.exit_code, output.duration),
            Err(failure) => RunOutcome::failed(
                FailureKind::Validation,
                output.exit_code,
                failure.to_string(),
                output.duration,
            ),
        }
    }

    fn finish(&mut self, session: &Session, result: Result<RunReport>) -> Result<RunReport> {
        match result {
            Ok(report) => {
                self.store
                    .end_session(session, report.verdict.session_outcome(), None)?;
                Ok(report)
            }
            Err(e) => {
                self.abort(session, &e);
                Err(e)
            }
        }
    }

    fn abort(&mut self, session: &Session, error: &Error) {
        if let Err(e) = self
            .store
            .end_session(session, SessionOutcome::Aborted, Some(&error.to_string()))
        {
            log::warn!("Could not close session {}: {e}", session.id);
        }
    }

    /// Record a configuration failure and turn it into an error.
    fn reject(&mut self, kind: SessionKind, error: ConfigError) -> Error {
        log::error!("{error}");
        if let Err(e) = self.store.record_config_failure(kind, &error) {
            log::warn!("Could not record failed session: {e}");
        }
        error.into()
    }
}

fn first_in(plan: &Plan, id: &str, set: &BTreeSet<String>) -> Option<String> {
    plan.graph()
        .predecessors(id)
        .find(|p| set.contains(*p))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ActionOutput, Relationship};
    use crate::record::{ErrorClass, RollbackOutcome, StepOutcome};
    use crate::store::MemoryStore;
    use crate::testing::{RecordingProgress, ScriptedRunner, StaticDiscovery};
    use crate::types::{
        IdempotencyCheck, RenderedAction, ResourceRef, RollbackStep, ValidationCheck,
    };
    use std::time::Duration;

    fn op(id: &str, requires: &[&str]) -> OperationDefinition {
        OperationDefinition::new(id, RenderedAction::bash(format!("create {id}")))
            .requires(requires.iter().copied())
    }

    fn probed(id: &str, requires: &[&str]) -> OperationDefinition {
        op(id, requires).with_idempotency(IdempotencyCheck::Command {
            action: RenderedAction::bash(format!("probe {id}")),
        })
    }

    fn undo(id: &str, n: usize) -> RollbackStep {
        RollbackStep::new(format!("undo-{n}"), RenderedAction::bash(format!("undo {id} {n}")))
    }

    fn fail(code: i32, stderr: &str) -> ActionOutput {
        ActionOutput::exited(code).with_stderr(stderr)
    }

    #[test]
    fn test_full_run_in_dependency_order() {
        let plan = Plan::build(vec![op("c", &["a"]), op("b", &["a"]), op("a", &[])]).unwrap();
        let runner = ScriptedRunner::new();
        let mut store = MemoryStore::new();

        let report = Engine::new(&mut store, &runner).run(&plan).unwrap();

        assert_eq!(runner.calls(), vec!["create a", "create b", "create c"]);
        assert_eq!(report.verdict, Verdict::Succeeded);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.executed_with(RunStatus::Succeeded), 3);
        assert_eq!(store.fingerprint().unwrap().as_deref(), Some(plan.fingerprint()));
        let sessions = store.sessions().unwrap();
        assert_eq!(sessions[0].outcome, Some(SessionOutcome::Succeeded));
    }

    #[test]
    fn test_cycle_executes_nothing() {
        let runner = ScriptedRunner::new();
        let mut store = MemoryStore::new();

        let err = Plan::build(vec![op("A", &["B"]), op("B", &["A"])]).unwrap_err();
        store.record_config_failure(SessionKind::Run, &err).unwrap();

        assert_eq!(
            err,
            ConfigError::CycleDetected {
                path: vec!["A".into(), "B".into()]
            }
        );
        assert!(runner.calls().is_empty());
        assert!(store.all_runs().unwrap().is_empty());
        assert_eq!(
            store.sessions().unwrap()[0].outcome,
            Some(SessionOutcome::ConfigError)
        );
    }

    #[test]
    fn test_rerun_of_finished_deployment_only_probes() {
        let plan = Plan::build(vec![probed("rg", &[]), probed("vnet", &["rg"]), probed("vm", &["vnet"])])
            .unwrap();
        let mut store = MemoryStore::new();

        let first = ScriptedRunner::new()
            .on("probe rg", ActionOutput::exited(1))
            .on("probe vnet", ActionOutput::exited(1))
            .on("probe vm", ActionOutput::exited(1));
        let report = Engine::new(&mut store, &first).run(&plan).unwrap();
        assert_eq!(report.executed_with(RunStatus::Succeeded), 3);

        // Everything exists now: probes exit 0
        let second = ScriptedRunner::new();
        let report = Engine::new(&mut store, &second).run(&plan).unwrap();

        assert_eq!(report.executed_with(RunStatus::SkippedIdempotent), 3);
        assert_eq!(second.calls(), vec!["probe rg", "probe vnet", "probe vm"]);
        assert!(second.calls().iter().all(|c| c.starts_with("probe")));
        for run in store.all_runs().unwrap().iter().filter(|r| r.attempt == 2) {
            assert_eq!(run.status, RunStatus::SkippedIdempotent);
            assert_eq!(run.duration_ms, 0);
        }
    }

    #[test]
    fn test_failure_rolls_back_halts_and_resume_starts_there() {
        let plan = Plan::build(vec![
            op("A", &[]),
            op("B", &["A"]).with_rollback(undo("B", 1)).with_rollback(undo("B", 2)),
            op("C", &["B"]),
            op("D", &[]),
        ])
        .unwrap();
        assert_eq!(plan.order(), ["A", "B", "C", "D"]);
        let mut store = MemoryStore::new();

        let runner = ScriptedRunner::new().on("create B", fail(1, "quota exceeded"));
        let report = Engine::new(&mut store, &runner).run(&plan).unwrap();

        assert_eq!(
            runner.calls(),
            vec!["create A", "create B", "undo B 1", "undo B 2"]
        );
        assert_eq!(report.verdict, Verdict::Halted);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.halted_by.as_deref(), Some("B"));
        assert_eq!(report.status_of("A"), Some(RunStatus::Succeeded));
        assert_eq!(report.status_of("B"), Some(RunStatus::Failed));
        assert_eq!(
            report.entry("C").unwrap().disposition,
            Disposition::Blocked { by: "B".into() }
        );
        assert_eq!(report.entry("D").unwrap().disposition, Disposition::NotReached);
        assert!(store.latest_run("C").unwrap().is_none());

        let failed = store.latest_run("B").unwrap().unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("quota exceeded"));
        assert_eq!(failed.failure_kind, Some(FailureKind::Execution));
        assert!(failed.rolled_back);
        let records = store.rollback_records("B").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].trigger, RollbackTrigger::Automatic);

        // Operator fixes the quota and resumes
        let retry = ScriptedRunner::new();
        let report = Engine::new(&mut store, &retry).resume(&plan).unwrap();

        assert_eq!(report.resumed_from.as_deref(), Some("B"));
        assert_eq!(retry.calls(), vec!["create B", "create C", "create D"]);
        assert_eq!(retry.count("create A"), 0);
        assert_eq!(report.entry("A").unwrap().disposition, Disposition::Carried);
        assert_eq!(report.verdict, Verdict::Succeeded);

        let b = store.latest_run("B").unwrap().unwrap();
        assert_eq!(b.attempt, 2);
        assert_eq!(b.retry_count, 1);
    }

    #[test]
    fn test_exit_zero_with_failed_validation_is_failed() {
        let target = ResourceRef::new("vm", "X");
        let plan = Plan::build(vec![
            op("create-X", &[])
                .with_validation(ValidationCheck::ResourceExists {
                    resource: target.clone(),
                })
                .with_rollback(undo("create-X", 1)),
        ])
        .unwrap();
        let runner = ScriptedRunner::new();
        let discovery = StaticDiscovery::new();
        let mut store = MemoryStore::new();

        let report = Engine::new(&mut store, &runner)
            .with_discovery(&discovery)
            .run(&plan)
            .unwrap();

        let run = store.latest_run("create-X").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_kind, Some(FailureKind::Validation));
        assert_eq!(run.exit_code, Some(0));
        assert!(run.error_message.unwrap().contains("vm/X not found"));
        assert_eq!(runner.calls(), vec!["create create-X", "undo create-X 1"]);
        assert_eq!(report.verdict, Verdict::Halted);
    }

    #[test]
    fn test_satisfied_probe_skips_without_invoking_action() {
        let x = ResourceRef::new("storage", "X");
        let plan = Plan::build(vec![
            op("create-X", &[]).with_idempotency(IdempotencyCheck::ResourceExists { resource: x }),
            op("use-X", &["create-X"]),
        ])
        .unwrap();
        let runner = ScriptedRunner::new();
        let discovery = StaticDiscovery::new().with("storage", "X");
        let mut store = MemoryStore::new();
        let mut progress = RecordingProgress::default();

        let report = Engine::new(&mut store, &runner)
            .with_discovery(&discovery)
            .with_progress(&mut progress)
            .run(&plan)
            .unwrap();

        assert_eq!(report.status_of("create-X"), Some(RunStatus::SkippedIdempotent));
        assert_eq!(report.status_of("use-X"), Some(RunStatus::Succeeded));
        assert_eq!(runner.calls(), vec!["create use-X"]);
        assert!(progress.events.contains(&"probe create-X true".to_string()));
        assert!(progress.events.contains(&"done create-X SKIPPED_IDEMPOTENT".to_string()));
    }

    #[test]
    fn test_failing_rollback_step_keeps_failed_status() {
        let plan = Plan::build(vec![
            op("vm", &[])
                .with_rollback(undo("vm", 1))
                .with_rollback(undo("vm", 2)),
        ])
        .unwrap();
        let runner = ScriptedRunner::new()
            .on("create vm", fail(1, "allocation failed"))
            .on("undo vm 1", fail(1, "nic still attached"));
        let mut store = MemoryStore::new();

        Engine::new(&mut store, &runner).run(&plan).unwrap();

        assert_eq!(runner.calls(), vec!["create vm", "undo vm 1", "undo vm 2"]);
        let run = store.latest_run("vm").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(!run.rolled_back);
        let record = &store.rollback_records("vm").unwrap()[0];
        assert_eq!(record.outcome, RollbackOutcome::Incomplete);
        assert_eq!(record.steps[1].outcome, StepOutcome::Succeeded);
    }

    #[test]
    fn test_continue_on_error_degrades_and_blocks_dependents() {
        let plan = Plan::build(vec![
            op("diag", &[]).continue_on_error(true),
            op("alerts", &["diag"]),
            op("vnet", &[]),
        ])
        .unwrap();
        let runner = ScriptedRunner::new().on("create diag", fail(2, "workspace not found"));
        let mut store = MemoryStore::new();

        let report = Engine::new(&mut store, &runner).run(&plan).unwrap();

        assert_eq!(report.verdict, Verdict::Degraded);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.status_of("vnet"), Some(RunStatus::Succeeded));
        let blocked: Vec<_> = report.blocked().map(|e| e.operation_id.as_str()).collect();
        assert_eq!(blocked, vec!["alerts"]);
        assert_eq!(runner.count("create alerts"), 0);
        assert_eq!(
            store.sessions().unwrap()[0].outcome,
            Some(SessionOutcome::Degraded)
        );
    }

    #[test]
    fn test_resume_carries_later_successes() {
        let plan = Plan::build(vec![
            op("a", &[]).continue_on_error(true),
            op("b", &[]),
        ])
        .unwrap();
        let mut store = MemoryStore::new();

        let runner = ScriptedRunner::new().on("create a", fail(1, "transient"));
        Engine::new(&mut store, &runner).run(&plan).unwrap();

        let retry = ScriptedRunner::new();
        let report = Engine::new(&mut store, &retry).resume(&plan).unwrap();
        assert_eq!(retry.calls(), vec!["create a"]);
        assert_eq!(report.entry("b").unwrap().disposition, Disposition::Carried);
        assert_eq!(store.runs_for("b").unwrap().len(), 1);
    }

    #[test]
    fn test_halted_resume_still_carries_finished_operations() {
        let plan = Plan::build(vec![op("a", &[]), op("b", &[])]).unwrap();
        let mut store = MemoryStore::new();

        let failing = ScriptedRunner::new().on("create a", fail(1, "quota exceeded"));
        let report = Engine::new(&mut store, &failing).run(&plan).unwrap();
        assert_eq!(report.entry("b").unwrap().disposition, Disposition::NotReached);
        Engine::new(&mut store, &ScriptedRunner::new())
            .run_operation(&plan, "b")
            .unwrap();

        let still_failing = ScriptedRunner::new().on("create a", fail(1, "quota exceeded"));
        let report = Engine::new(&mut store, &still_failing).resume(&plan).unwrap();
        assert_eq!(report.verdict, Verdict::Halted);
        assert_eq!(still_failing.calls(), vec!["create a"]);
        assert_eq!(report.entry("b").unwrap().disposition, Disposition::Carried);
        assert_eq!(report.status_of("b"), Some(RunStatus::Succeeded));
    }

    #[test]
    fn test_resume_with_nothing_left_executes_nothing() {
        let plan = Plan::build(vec![op("a", &[]), op("b", &["a"])]).unwrap();
        let mut store = MemoryStore::new();
        Engine::new(&mut store, &ScriptedRunner::new()).run(&plan).unwrap();

        let runner = ScriptedRunner::new();
        let report = Engine::new(&mut store, &runner).resume(&plan).unwrap();
        assert!(runner.calls().is_empty());
        assert_eq!(report.verdict, Verdict::Succeeded);
        assert!(report.resumed_from.is_none());
    }

    #[test]
    fn test_resume_rejects_changed_definitions() {
        let mut store = MemoryStore::new();
        let plan = Plan::build(vec![op("a", &[])]).unwrap();
        let runner = ScriptedRunner::new().on("create a", fail(1, "nope"));
        Engine::new(&mut store, &runner).run(&plan).unwrap();

        let mut edited = op("a", &[]);
        edited.action = RenderedAction::bash("create a --sku Standard");
        let edited = Plan::build(vec![edited]).unwrap();

        let retry = ScriptedRunner::new();
        let err = Engine::new(&mut store, &retry).resume(&edited).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::DefinitionsChanged { .. })
        ));
        assert!(retry.calls().is_empty());
        let last = store.sessions().unwrap().pop().unwrap();
        assert_eq!(last.kind, SessionKind::Resume);
        assert_eq!(last.outcome, Some(SessionOutcome::ConfigError));
    }

    #[test]
    fn test_single_operation_runs_out_of_order() {
        let plan = Plan::build(vec![op("a", &[]), op("b", &["a"])]).unwrap();
        let runner = ScriptedRunner::new();
        let mut store = MemoryStore::new();

        let report = Engine::new(&mut store, &runner).run_operation(&plan, "b").unwrap();

        assert_eq!(runner.calls(), vec!["create b"]);
        assert_eq!(report.verdict, Verdict::Succeeded);
        let run = store.latest_run("b").unwrap().unwrap();
        assert!(run.out_of_order);
        assert!(store.latest_run("a").unwrap().is_none());

        let err = Engine::new(&mut store, &runner)
            .run_operation(&plan, "ghost")
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);
    }

    #[test]
    fn test_manual_rollback_makes_operation_eligible_again() {
        let plan = Plan::build(vec![op("a", &[]), op("b", &["a"]).with_rollback(undo("b", 1))]).unwrap();
        let mut store = MemoryStore::new();
        Engine::new(&mut store, &ScriptedRunner::new()).run(&plan).unwrap();

        let runner = ScriptedRunner::new();
        let report = Engine::new(&mut store, &runner).rollback(&plan, "b").unwrap();
        assert_eq!(runner.calls(), vec!["undo b 1"]);
        assert_eq!(report.run.status, RunStatus::RolledBack);
        assert!(report.run.rolled_back);
        assert_eq!(report.record.trigger, RollbackTrigger::Manual);

        let again = ScriptedRunner::new();
        let report = Engine::new(&mut store, &again).resume(&plan).unwrap();
        assert_eq!(report.resumed_from.as_deref(), Some("b"));
        assert_eq!(again.calls(), vec!["create b"]);
    }

    #[test]
    fn test_manual_rollback_errors() {
        let plan = Plan::build(vec![op("a", &[]), op("b", &[]).with_rollback(undo("b", 1))]).unwrap();
        let runner = ScriptedRunner::new();
        let mut store = MemoryStore::new();
        let mut engine = Engine::new(&mut store, &runner);

        assert!(matches!(
            engine.rollback(&plan, "a"),
            Err(Error::NoRollbackSteps { .. })
        ));
        assert!(matches!(
            engine.rollback(&plan, "b"),
            Err(Error::NothingToRollBack { .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_timeout_and_spawn_failure() {
        let plan = Plan::build(vec![
            op("slow", &[])
                .with_timeout(Duration::from_secs(7))
                .continue_on_error(true),
            op("missing-cli", &[]).continue_on_error(true),
        ])
        .unwrap();
        let runner = ScriptedRunner::new()
            .on("create slow", ActionOutput::timeout(Duration::ZERO))
            .failing_spawn("create missing-cli");
        let mut store = MemoryStore::new();

        Engine::new(&mut store, &runner).run(&plan).unwrap();

        let slow = store.latest_run("slow").unwrap().unwrap();
        assert_eq!(slow.failure_kind, Some(FailureKind::Timeout));
        assert_eq!(slow.error_message.as_deref(), Some("timed out after 7s"));

        let missing = store.latest_run("missing-cli").unwrap().unwrap();
        assert_eq!(missing.failure_kind, Some(FailureKind::Execution));
        assert!(missing.error_message.unwrap().starts_with("failed to start action"));
    }

    #[test]
    fn test_classifier_result_is_stored() {
        let plan = Plan::build(vec![op("kv", &[])]).unwrap();
        let runner = ScriptedRunner::new().on("create kv", fail(1, "VaultAlreadyExists: soft-deleted"));
        let classifier = |out: &ActionOutput| {
            out.stderr.contains("AlreadyExists").then(|| ErrorClass {
                category: "conflict".into(),
                retryable: false,
                destructive: true,
                advice: Some("purge the soft-deleted vault".into()),
            })
        };
        let mut store = MemoryStore::new();

        Engine::new(&mut store, &runner)
            .with_classifier(&classifier)
            .run(&plan)
            .unwrap();

        let class = store.latest_run("kv").unwrap().unwrap().error_class.unwrap();
        assert_eq!(class.category, "conflict");
        assert!(class.destructive);
    }

    #[test]
    fn test_unavailable_probe_proceeds() {
        let plan = Plan::build(vec![probed("a", &[])]).unwrap();
        let runner = ScriptedRunner::new().failing_spawn("probe a");
        let mut store = MemoryStore::new();

        let report = Engine::new(&mut store, &runner).run(&plan).unwrap();
        assert_eq!(runner.calls(), vec!["probe a", "create a"]);
        assert_eq!(report.status_of("a"), Some(RunStatus::Succeeded));
    }

    #[test]
    fn test_failed_operation_is_not_retried_within_an_invocation() {
        let plan = Plan::build(vec![op("a", &[]).continue_on_error(true), op("b", &[])]).unwrap();
        let runner = ScriptedRunner::new().on("create a", fail(1, "x"));
        let mut store = MemoryStore::new();

        Engine::new(&mut store, &runner).run(&plan).unwrap();
        assert_eq!(runner.count("create a"), 1);
        assert_eq!(store.runs_for("a").unwrap().len(), 1);
    }

    #[test]
    fn test_checkpoints_increase_across_a_run() {
        let plan = Plan::build(vec![op("a", &[]), op("b", &["a"]), probed("c", &["b"])]).unwrap();
        let mut store = MemoryStore::new();
        Engine::new(&mut store, &ScriptedRunner::new()).run(&plan).unwrap();

        let seqs: Vec<u64> = store.all_runs().unwrap().iter().map(|r| r.checkpoint_seq).collect();
        assert_eq!(seqs.len(), 3);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_discovered_relationship_gates_execution() {
        let vnet = ResourceRef::new("vnet", "hub");
        let vm = ResourceRef::new("vm", "web");
        let defs = vec![
            op("a-vm", &[]).with_target(vm.clone()),
            op("b-vnet", &[]).with_target(vnet.clone()),
        ];
        let discovery = StaticDiscovery::new().relate(Relationship {
            dependent: vm,
            dependency: vnet,
            kind: "subnet".into(),
        });
        let plan = Plan::build_with(defs, &discovery.relationships().unwrap()).unwrap();
        assert_eq!(plan.order(), ["b-vnet", "a-vm"]);

        let runner = ScriptedRunner::new().on("create b-vnet", fail(1, "denied"));
        let mut store = MemoryStore::new();
        let report = Engine::new(&mut store, &runner).run(&plan).unwrap();
        assert_eq!(runner.count("create a-vm"), 0);
        assert_eq!(
            report.entry("a-vm").unwrap().disposition,
            Disposition::Blocked { by: "b-vnet".into() }
        );
    }

    #[test]
    fn test_status_reports_resume_point() {
        let plan = Plan::build(vec![op("a", &[]), op("b", &["a"]), op("c", &["b"])]).unwrap();
        let mut store = MemoryStore::new();
        let runner = ScriptedRunner::new().on("create b", fail(1, "boom"));
        Engine::new(&mut store, &runner).run(&plan).unwrap();

        let report = status(&plan, &store).unwrap();
        assert_eq!(report.resume_point.as_deref(), Some("b"));
        assert!(report.has_failures());
        assert!(report.fingerprint_matches);
        assert_eq!(report.entries[2].status(), RunStatus::Pending);
        assert_eq!(report.entries[1].attempts, 1);
    }

    #[test]
    fn test_preview_probes_without_executing() {
        let plan = Plan::build(vec![probed("a", &[]), op("b", &["a"])]).unwrap();
        let runner = ScriptedRunner::new();
        let mut store = MemoryStore::new();

        let preview = Engine::new(&mut store, &runner).preview(&plan);
        assert_eq!(runner.calls(), vec!["probe a"]);
        assert!(!preview[0].would_execute());
        assert!(preview[1].would_execute());
        assert!(store.all_runs().unwrap().is_empty());
    }
}
