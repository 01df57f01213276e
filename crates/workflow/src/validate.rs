//! Idempotency probes and post-condition checks.

use crate::context::{ActionOutput, ActionRunner, Discovery, ResourceRecord};
use crate::types::{IdempotencyCheck, PollPolicy, ResourceRef, ValidationCheck};
use serde_json::Value;
use std::time::Duration;

/// Result of an idempotency probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Goal state already holds; skip the operation
    Satisfied,
    /// Goal state does not hold; execute
    NotSatisfied,
    /// The probe could not run; treated like `NotSatisfied`
    Unavailable(String),
}

impl ProbeResult {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied)
    }
}

/// Run a read-only idempotency probe.
pub fn probe(
    check: &IdempotencyCheck,
    runner: &dyn ActionRunner,
    discovery: &dyn Discovery,
    timeout: Duration,
) -> ProbeResult {
    match check {
        IdempotencyCheck::Command { action } => match runner.run(action, timeout) {
            Ok(output) if output.success() => ProbeResult::Satisfied,
            Ok(output) if output.timed_out => {
                ProbeResult::Unavailable(format!("probe timed out after {}s", timeout.as_secs()))
            }
            Ok(_) => ProbeResult::NotSatisfied,
            Err(e) => ProbeResult::Unavailable(format!("{e:#}")),
        },
        IdempotencyCheck::ResourceExists { resource } => match lookup(discovery, resource) {
            Ok(Some(_)) => ProbeResult::Satisfied,
            Ok(None) => ProbeResult::NotSatisfied,
            Err(e) => ProbeResult::Unavailable(format!("{e:#}")),
        },
    }
}

fn lookup(discovery: &dyn Discovery, resource: &ResourceRef) -> anyhow::Result<Option<ResourceRecord>> {
    discovery.lookup(&resource.resource_type, &resource.name, resource.scope.as_deref())
}

/// A post-condition that did not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    /// Position of the check in the declared list
    pub index: usize,
    pub kind: &'static str,
    pub message: String,
}

impl std::fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "validation check #{} ({}) failed: {}", self.index + 1, self.kind, self.message)
    }
}

/// Run checks in order, stopping at the first failure.
///
/// Discovery-backed checks are retried according to `poll`; the exit code
/// check is evaluated once.
pub fn run_checks(
    checks: &[ValidationCheck],
    output: &ActionOutput,
    discovery: &dyn Discovery,
    poll: PollPolicy,
) -> Result<(), CheckFailure> {
    for (index, check) in checks.iter().enumerate() {
        let attempts = if check.uses_discovery() { poll.attempts.max(1) } else { 1 };
        let mut last = Ok(());
        for attempt in 1..=attempts {
            last = evaluate(check, output, discovery);
            match &last {
                Ok(()) => break,
                Err(message) if attempt < attempts => {
                    log::debug!(
                        "Check {} not yet satisfied ({message}), polling again in {:?}",
                        check.kind(),
                        poll.interval
                    );
                    if let Some(resource) = check.resource() {
                        discovery.invalidate(
                            &resource.resource_type,
                            &resource.name,
                            resource.scope.as_deref(),
                        );
                    }
                    std::thread::sleep(poll.interval);
                }
                Err(_) => {}
            }
        }
        if let Err(message) = last {
            return Err(CheckFailure {
                index,
                kind: check.kind(),
                message,
            });
        }
        log::debug!("Check {} passed", check.kind());
    }
    Ok(())
}

fn evaluate(
    check: &ValidationCheck,
    output: &ActionOutput,
    discovery: &dyn Discovery,
) -> Result<(), String> {
    match check {
        ValidationCheck::ExitCodeEquals { expected } => {
            if output.exit_code == Some(*expected) {
                Ok(())
            } else {
                Err(format!(
                    "expected exit code {expected}, got {}",
                    output
                        .exit_code
                        .map_or_else(|| "none".to_string(), |c| c.to_string())
                ))
            }
        }
        ValidationCheck::ResourceExists { resource } => {
            found(discovery, resource).map(|_| ())
        }
        ValidationCheck::PropertyEquals {
            resource,
            path,
            expected,
        } => {
            let record = found(discovery, resource)?;
            match resolve(&record.properties, path) {
                Some(actual) if values_match(actual, expected) => Ok(()),
                Some(actual) => Err(format!(
                    "{resource} property '{path}' is {actual}, expected {expected}"
                )),
                None => Err(format!("{resource} has no property '{path}'")),
            }
        }
        ValidationCheck::ProvisioningStateEquals { resource, expected } => {
            let record = found(discovery, resource)?;
            match record.provisioning_state.as_deref() {
                Some(state) if state.eq_ignore_ascii_case(expected) => Ok(()),
                Some(state) => Err(format!(
                    "{resource} provisioning state is '{state}', expected '{expected}'"
                )),
                None => Err(format!("{resource} reports no provisioning state")),
            }
        }
    }
}

fn found(discovery: &dyn Discovery, resource: &ResourceRef) -> Result<ResourceRecord, String> {
    match lookup(discovery, resource) {
        Ok(Some(record)) => Ok(record),
        Ok(None) => Err(format!("{resource} not found")),
        Err(e) => Err(format!("lookup of {resource} failed: {e:#}")),
    }
}

/// Resolve a property path inside a JSON document.
///
/// Paths starting with `/` are JSON pointers. Anything else is a dotted path
/// with optional `[n]` indexes (`subnets[0].name`); a leading `properties.`
/// segment is ignored.
pub fn resolve<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    if path.starts_with('/') {
        return root.pointer(path);
    }
    let path = path.strip_prefix("properties.").unwrap_or(path);
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indexes) = match segment.find('[') {
            Some(at) => segment.split_at(at),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indexes.split('[').filter(|s| !s.is_empty()) {
            let n: usize = index.strip_suffix(']')?.parse().ok()?;
            current = current.get(n)?;
        }
    }
    Some(current)
}

/// JSON equality, letting a string expectation match a scalar's text form.
fn values_match(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(n), Value::String(s)) => n.to_string() == *s,
        (Value::Bool(b), Value::String(s)) => s.eq_ignore_ascii_case(if *b { "true" } else { "false" }),
        (Value::String(a), Value::Number(n)) => *a == n.to_string(),
        _ => false,
    }
}
