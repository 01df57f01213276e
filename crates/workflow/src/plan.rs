//! Validated, ordered definition sets.

use crate::context::Relationship;
use crate::error::ConfigError;
use crate::graph::DependencyGraph;
use crate::types::OperationDefinition;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// A definition set that passed every pre-execution check.
///
/// Holds the dependency graph, the deterministic execution order and a
/// fingerprint of the definitions. Building a plan performs no side effects.
#[derive(Debug, Clone)]
pub struct Plan {
    definitions: BTreeMap<String, OperationDefinition>,
    graph: DependencyGraph,
    order: Vec<String>,
    fingerprint: String,
}

impl Plan {
    /// Plan from declared predecessors only.
    pub fn build(definitions: Vec<OperationDefinition>) -> Result<Self, ConfigError> {
        Self::build_with(definitions, &[])
    }

    /// Plan with discovered relationships folded into the graph.
    pub fn build_with(
        definitions: Vec<OperationDefinition>,
        relationships: &[Relationship],
    ) -> Result<Self, ConfigError> {
        let graph = DependencyGraph::build_with(&definitions, relationships)?;
        for def in &definitions {
            check_duration(def)?;
        }
        let order = graph.topological_order()?;

        let definitions: BTreeMap<String, OperationDefinition> = definitions
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        let fingerprint = fingerprint(&definitions)?;

        log::debug!(
            "Planned {} operations, fingerprint {}",
            order.len(),
            &fingerprint[..12.min(fingerprint.len())]
        );

        Ok(Self {
            definitions,
            graph,
            order,
            fingerprint,
        })
    }

    /// Execution order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// BLAKE3 hex digest of the definitions.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Look up a definition by id.
    pub fn get(&self, id: &str) -> Result<&OperationDefinition, ConfigError> {
        self.definitions
            .get(id)
            .ok_or_else(|| ConfigError::UnknownOperation { id: id.to_string() })
    }

    /// Definitions in execution order.
    pub fn definitions(&self) -> impl Iterator<Item = &OperationDefinition> {
        self.order.iter().filter_map(|id| self.definitions.get(id))
    }

    /// Position of `id` in the execution order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|o| o == id)
    }

    /// Capabilities present, sorted.
    pub fn capabilities(&self) -> BTreeSet<&str> {
        self.definitions
            .values()
            .map(|d| d.capability.as_str())
            .collect()
    }

    /// Narrow the plan to one capability plus everything it depends on.
    ///
    /// The fingerprint of the full set is kept, so a narrowed run and a full
    /// resume agree on which definitions they belong to.
    pub fn restrict_to_capability(&self, capability: &str) -> Result<Self, ConfigError> {
        let mut keep: BTreeSet<String> = BTreeSet::new();
        for def in self.definitions.values() {
            if def.capability == capability {
                keep.insert(def.id.clone());
                keep.extend(self.graph.ancestors(&def.id));
            }
        }
        if keep.is_empty() {
            return Err(ConfigError::UnknownOperation {
                id: format!("capability:{capability}"),
            });
        }

        let subset: Vec<OperationDefinition> = self
            .definitions
            .values()
            .filter(|d| keep.contains(&d.id))
            .cloned()
            .collect();
        let graph = DependencyGraph::build(&subset)?;
        let order = self
            .order
            .iter()
            .filter(|id| keep.contains(*id))
            .cloned()
            .collect();

        Ok(Self {
            definitions: subset.into_iter().map(|d| (d.id.clone(), d)).collect(),
            graph,
            order,
            fingerprint: self.fingerprint.clone(),
        })
    }
}

fn check_duration(def: &OperationDefinition) -> Result<(), ConfigError> {
    let d = &def.duration;
    if d.timeout == Duration::ZERO || d.timeout < d.expected {
        return Err(ConfigError::InvalidDuration {
            operation: def.id.clone(),
            expected_secs: d.expected.as_secs(),
            timeout_secs: d.timeout.as_secs(),
        });
    }
    Ok(())
}

fn fingerprint(definitions: &BTreeMap<String, OperationDefinition>) -> Result<String, ConfigError> {
    let mut hasher = blake3::Hasher::new();
    for def in definitions.values() {
        let bytes = serde_json::to_vec(def).map_err(|e| ConfigError::Fingerprint {
            reason: e.to_string(),
        })?;
        hasher.update(&bytes);
        hasher.update(b"\n");
    }
    Ok(hasher.finalize().to_hex().to_string())
}
