//! Dependency graph over operation ids.
//!
//! Edges run from predecessor to successor: `from` must reach terminal
//! success before `to` may start. Edges come from each definition's
//! `requires` set and, optionally, from discovered resource relationships.

use crate::context::Relationship;
use crate::error::ConfigError;
use crate::types::OperationDefinition;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

/// Where an edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSource {
    Declared,
    Discovered,
}

/// A single ordering constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub source: EdgeSource,
}

/// Summary numbers for a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub total_operations: usize,
    pub operations_with_dependencies: usize,
    pub total_dependencies: usize,
    pub max_dependencies: usize,
    /// Operation with the most predecessors (smallest id on ties)
    pub most_dependent: Option<String>,
    pub discovered_edges: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Directed graph of operation ids.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    predecessors: BTreeMap<String, BTreeSet<String>>,
    successors: BTreeMap<String, BTreeSet<String>>,
    sources: BTreeMap<(String, String), EdgeSource>,
}

impl DependencyGraph {
    /// Build the graph from declared predecessors.
    ///
    /// Fails on empty or duplicate ids, unknown predecessors and self-loops.
    /// No partial graph is returned.
    pub fn build<'a, I>(definitions: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = &'a OperationDefinition>,
    {
        let definitions: Vec<&OperationDefinition> = definitions.into_iter().collect();
        let mut graph = Self::default();

        for def in &definitions {
            if def.id.trim().is_empty() {
                return Err(ConfigError::EmptyId);
            }
            if graph.predecessors.contains_key(&def.id) {
                return Err(ConfigError::DuplicateOperation { id: def.id.clone() });
            }
            graph.predecessors.insert(def.id.clone(), BTreeSet::new());
            graph.successors.insert(def.id.clone(), BTreeSet::new());
        }

        for def in &definitions {
            for required in &def.requires {
                if required == &def.id {
                    return Err(ConfigError::SelfDependency {
                        operation: def.id.clone(),
                    });
                }
                if !graph.contains(required) {
                    return Err(ConfigError::MissingPredecessor {
                        operation: def.id.clone(),
                        missing: required.clone(),
                    });
                }
                graph.insert_edge(required, &def.id, EdgeSource::Declared);
            }
        }

        Ok(graph)
    }

    /// Build the graph and augment it with discovered relationships.
    pub fn build_with<'a, I>(
        definitions: I,
        relationships: &[Relationship],
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = &'a OperationDefinition> + Clone,
    {
        let mut graph = Self::build(definitions.clone())?;
        graph.add_relationships(definitions, relationships);
        Ok(graph)
    }

    /// Map resource relationships onto operation edges.
    ///
    /// A fact `dependent -> dependency` adds `op(dependency) -> op(dependent)`
    /// when both resources are some operation's target. Facts about
    /// untargeted resources, and facts that map an operation onto itself, are
    /// ignored. Returns the number of edges added.
    pub fn add_relationships<'a, I>(&mut self, definitions: I, relationships: &[Relationship]) -> usize
    where
        I: IntoIterator<Item = &'a OperationDefinition>,
    {
        let targeted: Vec<&OperationDefinition> = definitions
            .into_iter()
            .filter(|d| d.target.is_some() && self.contains(&d.id))
            .collect();
        let owners = |resource: &crate::types::ResourceRef| -> Vec<String> {
            targeted
                .iter()
                .filter(|d| d.target.as_ref().is_some_and(|t| t.matches(resource)))
                .map(|d| d.id.clone())
                .collect()
        };

        let mut added = 0;
        for fact in relationships {
            let dependents = owners(&fact.dependent);
            if dependents.is_empty() {
                continue;
            }
            for from in owners(&fact.dependency) {
                for to in &dependents {
                    if &from == to {
                        continue;
                    }
                    if self.insert_edge(&from, to, EdgeSource::Discovered) {
                        log::debug!("Discovered dependency {from} -> {to} ({})", fact.kind);
                        added += 1;
                    }
                }
            }
        }
        added
    }

    fn insert_edge(&mut self, from: &str, to: &str, source: EdgeSource) -> bool {
        let key = (from.to_string(), to.to_string());
        if self.sources.contains_key(&key) {
            return false;
        }
        self.sources.insert(key, source);
        self.successors
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self.predecessors
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.predecessors.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.predecessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predecessors.is_empty()
    }

    /// Operation ids in lexicographic order.
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.predecessors.keys()
    }

    /// Direct predecessors of `id`.
    pub fn predecessors(&self, id: &str) -> impl Iterator<Item = &String> {
        self.predecessors.get(id).into_iter().flatten()
    }

    /// Direct successors of `id`.
    pub fn successors(&self, id: &str) -> impl Iterator<Item = &String> {
        self.successors.get(id).into_iter().flatten()
    }

    /// All transitive predecessors of `id`.
    pub fn ancestors(&self, id: &str) -> BTreeSet<String> {
        Self::reach(&self.predecessors, id)
    }

    /// All transitive successors of `id`.
    pub fn descendants(&self, id: &str) -> BTreeSet<String> {
        Self::reach(&self.successors, id)
    }

    fn reach(adjacency: &BTreeMap<String, BTreeSet<String>>, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&String> = adjacency.get(id).into_iter().flatten().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(adjacency.get(next).into_iter().flatten());
            }
        }
        seen
    }

    /// All edges, ordered by (from, to).
    pub fn edges(&self) -> impl Iterator<Item = DependencyEdge> + '_ {
        self.sources.iter().map(|((from, to), source)| DependencyEdge {
            from: from.clone(),
            to: to.clone(),
            source: *source,
        })
    }

    /// Find a cycle, if any.
    ///
    /// Depth-first over each operation's predecessors, roots and neighbours in
    /// lexicographic order. The returned path starts at the re-entered
    /// operation and follows `requires` links; the cycle closes back onto its
    /// first element.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

        for root in self.predecessors.keys() {
            if marks.contains_key(root.as_str()) {
                continue;
            }
            if let Some(cycle) = self.cycle_from(root, &mut marks) {
                return Some(cycle);
            }
        }
        None
    }

    /// Iterative depth-first walk from `root`. The frame stack is the current path.
    fn cycle_from<'g>(
        &'g self,
        root: &'g str,
        marks: &mut BTreeMap<&'g str, Mark>,
    ) -> Option<Vec<String>> {
        let mut stack: Vec<(&'g str, std::vec::IntoIter<&'g str>)> = Vec::new();
        marks.insert(root, Mark::InProgress);
        stack.push((root, self.requires_of(root)));

        while let Some((_, pending)) = stack.last_mut() {
            let Some(next) = pending.next() else {
                if let Some((done, _)) = stack.pop() {
                    marks.insert(done, Mark::Done);
                }
                continue;
            };
            match marks.get(next) {
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                    return Some(stack[start..].iter().map(|(n, _)| (*n).to_string()).collect());
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(next, Mark::InProgress);
                    stack.push((next, self.requires_of(next)));
                }
            }
        }
        None
    }

    fn requires_of(&self, id: &str) -> std::vec::IntoIter<&str> {
        self.predecessors(id)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Deterministic execution order.
    ///
    /// Checks for cycles first, then runs Kahn's algorithm always picking the
    /// ready operation with the smallest id, so identical input always yields
    /// identical output.
    pub fn topological_order(&self) -> Result<Vec<String>, ConfigError> {
        if let Some(path) = self.find_cycle() {
            return Err(ConfigError::CycleDetected { path });
        }

        let mut in_degree: BTreeMap<&str, usize> = self
            .predecessors
            .iter()
            .map(|(id, preds)| (id.as_str(), preds.len()))
            .collect();

        let mut ready: BinaryHeap<Reverse<&str>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id.to_string());
            for next in self.successors(id) {
                if let Some(degree) = in_degree.get_mut(next.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(next.as_str()));
                    }
                }
            }
        }

        if order.len() != self.len() {
            // Unreachable after find_cycle; report what is left rather than panic
            let remaining = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(ConfigError::CycleDetected { path: remaining });
        }

        Ok(order)
    }

    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            total_operations: self.len(),
            ..GraphStats::default()
        };
        for (id, preds) in &self.predecessors {
            if preds.is_empty() {
                continue;
            }
            stats.operations_with_dependencies += 1;
            stats.total_dependencies += preds.len();
            if preds.len() > stats.max_dependencies {
                stats.max_dependencies = preds.len();
                stats.most_dependent = Some(id.clone());
            }
        }
        stats.discovered_edges = self
            .sources
            .values()
            .filter(|s| **s == EdgeSource::Discovered)
            .count();
        stats
    }
}
