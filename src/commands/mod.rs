//! Command implementations and the setup they share.

pub mod graph;
pub mod history;
pub mod rollback;
pub mod run;
pub mod status;
pub mod unlock;
pub mod validate;

use crate::Context;
use crate::catalog::{Catalog, CatalogError, DefinitionDefaults};
use crate::classifier::PatternClassifier;
use crate::discovery::{CachedDiscovery, InventoryDiscovery};
use crate::render::Renderer;
use crate::state;
use anyhow::{Context as _, Result};
use dialoguer::Confirm;
use std::time::Duration;
use workflow::{ConfigError, Discovery, NoDiscovery, Plan, PollPolicy, SessionKind, StateStore};

/// Discovery from the configured inventory, cached when a TTL is set.
pub fn discovery(ctx: &Context) -> Box<dyn Discovery> {
    let Some(path) = ctx.config.inventory_path() else {
        log::debug!("No inventory configured, discovery disabled");
        return Box::new(NoDiscovery);
    };
    let inventory = InventoryDiscovery::new(path);
    log::debug!("Discovery from inventory {}", inventory.path().display());
    match ctx.config.discovery.cache_ttl_secs {
        0 => Box::new(inventory),
        ttl => Box::new(CachedDiscovery::new(inventory, Duration::from_secs(ttl))),
    }
}

/// Load the catalog, render every operation and order the result.
///
/// With `record` set, a configuration error is also written to the state
/// store as a session that ended in `config_error`.
pub fn load_plan(
    ctx: &Context,
    discovery: &dyn Discovery,
    record: Option<SessionKind>,
) -> Result<Plan> {
    let root = ctx.catalog_dir();
    let catalog = Catalog::load(&root, &ctx.config.allowed_capabilities())?;

    let renderer = Renderer::new(ctx.config.parameters());
    let defaults = DefinitionDefaults {
        poll: PollPolicy::new(
            ctx.config.discovery.poll_attempts,
            Duration::from_secs(ctx.config.discovery.poll_interval_secs),
        ),
    };
    let definitions = match catalog.definitions(&renderer, defaults) {
        Ok(definitions) => definitions,
        Err(CatalogError::Config(err)) => return Err(config_failure(ctx, record, err)),
        Err(err) => return Err(err.into()),
    };

    let relationships = discovery.relationships().unwrap_or_else(|e| {
        log::warn!("Could not read discovered relationships: {e:#}");
        Vec::new()
    });

    let plan = Plan::build_with(definitions, &relationships)
        .map_err(|err| config_failure(ctx, record, err))?;
    log::info!(
        "Planned {} operation(s) from {} (fingerprint {})",
        plan.len(),
        root.display(),
        &plan.fingerprint()[..12.min(plan.fingerprint().len())]
    );
    Ok(plan)
}

/// Record a configuration failure, best effort, and hand the error back.
pub fn config_failure(
    ctx: &Context,
    record: Option<SessionKind>,
    err: ConfigError,
) -> anyhow::Error {
    if let Some(kind) = record {
        match ctx.state_path().and_then(|path| state::open_writer(&path)) {
            Ok(mut store) => {
                if let Err(e) = store.record_config_failure(kind, &err) {
                    log::warn!("Could not record configuration failure: {e}");
                }
                if let Err(e) = store.close() {
                    log::warn!("Could not release state lease: {e}");
                }
            }
            Err(e) => log::warn!("Could not record configuration failure: {e:#}"),
        }
    }
    err.into()
}

pub fn classifier(ctx: &Context) -> Result<PatternClassifier> {
    PatternClassifier::with_patterns(&ctx.config.error_patterns)
}

/// Ask before a destructive step.
pub fn confirm(prompt: &str) -> Result<bool> {
    let confirmed = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("Confirmation needs a terminal; pass --yes to skip it")?;

    Ok(confirmed)
}

// ============================================================================
// Test fixtures
// ============================================================================

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::Context;
    use crate::catalog::tests::write_op;
    use crate::config::CapstanConfig;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// A workspace with a catalog root and a state path.
    pub struct Workspace {
        pub dir: TempDir,
    }

    impl Workspace {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("capabilities")).unwrap();
            Self { dir }
        }

        pub fn catalog(&self) -> PathBuf {
            self.dir.path().join("capabilities")
        }

        pub fn state(&self) -> PathBuf {
            self.dir.path().join("state.db")
        }

        /// Add an operation file under `<capability>/operations/<id>.yaml`.
        pub fn op(&self, capability: &str, id: &str, yaml: &str) -> &Self {
            write_op(&self.catalog(), capability, &format!("{id}.yaml"), yaml);
            self
        }

        pub fn context(&self) -> Context {
            Context {
                verbose: 0,
                quiet: true,
                config: CapstanConfig::default(),
                catalog: Some(self.catalog()),
                state: Some(self.state()),
            }
        }
    }

    /// Minimal operation document running `command` with bash.
    pub fn bash_op(id: &str, capability: &str, requires: &[&str], command: &str) -> String {
        let requires = if requires.is_empty() {
            "[]".to_string()
        } else {
            format!("[{}]", requires.join(", "))
        };
        format!(
            r#"operation:
  id: {id}
  name: Operation {id}
  description: Test operation {id}
  capability: {capability}
  operation_mode: create
  resource_type: Test/things
  requires: {requires}
  duration:
    expected: 5
    timeout: 10
    type: FAST
  template:
    type: bash
    command: |
      {command}
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{Workspace, bash_op};
    use super::*;

    #[test]
    fn test_load_plan_orders_catalog() {
        let ws = Workspace::new();
        ws.op("networking", "vnet", &bash_op("vnet", "networking", &["rg"], "true"))
            .op("networking", "rg", &bash_op("rg", "networking", &[], "true"));

        let ctx = ws.context();
        let plan = load_plan(&ctx, &NoDiscovery, None).unwrap();
        assert_eq!(plan.order(), ["rg".to_string(), "vnet".to_string()]);
    }

    #[test]
    fn test_config_failure_is_recorded_for_runs() {
        let ws = Workspace::new();
        ws.op("networking", "a", &bash_op("a", "networking", &["b"], "true"))
            .op("networking", "b", &bash_op("b", "networking", &["a"], "true"));

        let ctx = ws.context();
        let err = load_plan(&ctx, &NoDiscovery, Some(SessionKind::Run)).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());

        let store = state::open_reader(&ws.state()).unwrap().unwrap();
        let sessions = store.sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].outcome, Some(workflow::SessionOutcome::ConfigError));
    }

    #[test]
    fn test_read_only_commands_record_nothing() {
        let ws = Workspace::new();
        ws.op("networking", "a", &bash_op("a", "networking", &["a"], "true"));

        let ctx = ws.context();
        assert!(load_plan(&ctx, &NoDiscovery, None).is_err());
        assert!(!ws.state().exists());
    }

    #[test]
    fn test_discovery_without_inventory_is_disabled() {
        let ws = Workspace::new();
        let ctx = ws.context();
        assert!(discovery(&ctx).lookup("t", "n", None).is_err());
    }
}
