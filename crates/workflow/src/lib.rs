//! # Workflow
//!
//! Dependency-ordered execution of provisioning operations with durable run
//! state.
//!
//! ## Core Concepts
//!
//! - **OperationDefinition**: a declared unit of work with an idempotency
//!   probe, a rendered action, validation checks and rollback steps
//! - **DependencyGraph**: operations and their ordering constraints
//! - **Plan**: a validated definition set with one deterministic order
//! - **StateStore**: durable ledger of operation runs
//! - **Engine**: walks a plan, records every transition, rolls back failures
//!   and resumes where a previous invocation stopped
//!
//! ## Example
//!
//! ```ignore
//! use workflow::{Engine, MemoryStore, OperationDefinition, Plan, RenderedAction};
//!
//! let plan = Plan::build(vec![
//!     OperationDefinition::new("rg", RenderedAction::bash("az group create -n rg -l westeurope")),
//!     OperationDefinition::new("vnet", RenderedAction::bash("az network vnet create -g rg -n hub"))
//!         .requires(["rg"]),
//! ])?;
//!
//! let mut store = MemoryStore::new();
//! let report = Engine::new(&mut store, &my_runner).run(&plan)?;
//! std::process::exit(report.exit_code());
//! ```
//!
//! ## Provider Traits
//!
//! - [`ActionRunner`]: executes rendered actions with a hard timeout
//! - [`Discovery`]: read-only resource lookups and relationships
//! - [`ErrorClassifier`]: maps failed output to an error class
//! - [`ProgressCallback`]: receives progress updates
//!
//! The engine never spawns processes or prints on its own.

pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod plan;
pub mod record;
pub mod rollback;
pub mod store;
pub mod types;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types at crate root
pub use context::{
    ActionOutput, ActionRunner, Discovery, ErrorClassifier, NoClassifier, NoDiscovery,
    NoProgress, ProgressCallback, Relationship, ResourceRecord,
};
pub use engine::{
    Disposition, Engine, PreviewEntry, ReportEntry, RollbackReport, RunReport, StatusEntry,
    StatusReport, Verdict, status,
};
pub use error::{ConfigError, Error, ErrorCategory, Result, StoreError};
pub use graph::{DependencyEdge, DependencyGraph, EdgeSource, GraphStats};
pub use plan::Plan;
pub use record::{
    ErrorClass, FailureKind, OperationRun, RollbackOutcome, RollbackRecord, RollbackStepResult,
    RollbackTrigger, RunContext, RunOutcome, RunStatus, StepOutcome,
};
pub use store::{MemoryStore, Session, SessionKind, SessionOutcome, StateStore, StoreResult};
pub use types::{
    DurationClass, DurationSpec, IdempotencyCheck, Interpreter, OperationDefinition,
    OperationMode, PollPolicy, RenderedAction, ResourceRef, RollbackStep, ValidationCheck,
};
pub use validate::ProbeResult;
