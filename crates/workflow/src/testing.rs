//! In-process doubles for engine tests.

use crate::context::{
    ActionOutput, ActionRunner, Discovery, ProgressCallback, Relationship, ResourceRecord,
};
use crate::record::{OperationRun, RollbackStepResult};
use crate::types::RenderedAction;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

enum Scripted {
    Output(ActionOutput),
    SpawnError,
}

/// Runner answering from a table keyed by command text.
///
/// Unknown commands exit 0. Every invocation is recorded.
#[derive(Default)]
pub struct ScriptedRunner {
    script: HashMap<String, Scripted>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, command: &str, output: ActionOutput) -> Self {
        self.script.insert(command.to_string(), Scripted::Output(output));
        self
    }

    pub fn failing_spawn(mut self, command: &str) -> Self {
        self.script.insert(command.to_string(), Scripted::SpawnError);
        self
    }

    /// Commands invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == command).count()
    }
}

impl ActionRunner for ScriptedRunner {
    fn run(&self, action: &RenderedAction, timeout: Duration) -> anyhow::Result<ActionOutput> {
        self.calls.lock().unwrap().push(action.command.clone());
        match self.script.get(&action.command) {
            Some(Scripted::Output(out)) if out.timed_out => Ok(ActionOutput::timeout(timeout)),
            Some(Scripted::Output(out)) => Ok(out.clone()),
            Some(Scripted::SpawnError) => anyhow::bail!("failed to spawn: {}", action.command),
            None => Ok(ActionOutput::exited(0)),
        }
    }
}

/// Discovery over a fixed resource list.
#[derive(Default)]
pub struct StaticDiscovery {
    resources: Vec<ResourceRecord>,
    relationships: Vec<Relationship>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resource_type: &str, name: &str) -> Self {
        self.resources.push(ResourceRecord {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            provisioning_state: Some("Succeeded".to_string()),
            ..ResourceRecord::default()
        });
        self
    }

    pub fn relate(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }
}

impl Discovery for StaticDiscovery {
    fn lookup(
        &self,
        resource_type: &str,
        name: &str,
        _scope: Option<&str>,
    ) -> anyhow::Result<Option<ResourceRecord>> {
        Ok(self
            .resources
            .iter()
            .find(|r| r.resource_type == resource_type && r.name == name)
            .cloned())
    }

    fn relationships(&self) -> anyhow::Result<Vec<Relationship>> {
        Ok(self.relationships.clone())
    }
}

/// Progress callback that keeps a log of events.
#[derive(Default)]
pub struct RecordingProgress {
    pub events: Vec<String>,
}

impl ProgressCallback for RecordingProgress {
    fn on_plan(&mut self, order: &[String]) {
        self.events.push(format!("plan {}", order.join(",")));
    }

    fn on_operation_start(&mut self, id: &str, _name: &str) {
        self.events.push(format!("start {id}"));
    }

    fn on_probe(&mut self, id: &str, satisfied: bool) {
        self.events.push(format!("probe {id} {satisfied}"));
    }

    fn on_operation_complete(&mut self, run: &OperationRun) {
        self.events.push(format!("done {} {}", run.operation_id, run.status));
    }

    fn on_rollback_step(&mut self, id: &str, step: &RollbackStepResult) {
        self.events.push(format!("rollback {id} {}", step.name));
    }

    fn on_blocked(&mut self, id: &str, by: &str) {
        self.events.push(format!("blocked {id} by {by}"));
    }
}
