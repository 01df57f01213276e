//! `capstan.toml` schema and loading.

use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Capabilities accepted in catalogs when the config names none.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "networking",
    "storage",
    "identity",
    "compute",
    "avd",
    "management",
    "test-capability",
];

/// Catalog directory used when neither the command line nor the config names one.
pub const DEFAULT_CATALOG: &str = "capabilities";

// ============================================================================
// Main Config Schema
// ============================================================================

/// The capstan configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapstanConfig {
    /// Root of the operation catalog (`<capability>/operations/*.yaml`)
    #[serde(default)]
    pub catalog: Option<String>,

    /// State database path
    #[serde(default)]
    pub state: Option<String>,

    /// Inventory JSON used for discovery
    #[serde(default)]
    pub inventory: Option<String>,

    /// Capability names accepted in catalogs; empty means the built-in list
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Placeholder values substituted into templates
    #[serde(default)]
    pub parameters: BTreeMap<String, toml::Value>,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Output patterns used to classify failures
    #[serde(default)]
    pub error_patterns: Vec<ErrorPattern>,

    /// Directory of the file this was loaded from; relative paths resolve here
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Process execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Shell for bash, bash-script and azure-cli templates
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Executable for PowerShell templates
    #[serde(default = "default_powershell")]
    pub powershell: String,

    /// Working directory for actions
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Extra environment for every action
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_powershell() -> String {
    "pwsh".to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            powershell: default_powershell(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// How long a lookup result is reused
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Default tries for discovery-backed validation checks
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    /// Default pause between tries
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

const fn default_cache_ttl() -> u64 {
    10
}

const fn default_poll_attempts() -> u32 {
    1
}

const fn default_poll_interval() -> u64 {
    5
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            poll_attempts: default_poll_attempts(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// A regex over failed output mapped to an error class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub pattern: String,
    pub category: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub destructive: bool,
    #[serde(default)]
    pub advice: Option<String>,
}

impl CapstanConfig {
    /// Load the config.
    ///
    /// An explicit path must exist. Without one the default location is
    /// tried and a missing file yields the default config.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => {
                let path = paths::config_file()?;
                if !path.exists() {
                    log::debug!("No config at {}, using defaults", path.display());
                    return Ok(Self::default());
                }
                path
            }
        };
        Self::load_from(&path)
    }

    /// Load a specific config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolve a configured path against the config file's directory.
    fn resolve(&self, raw: &str) -> PathBuf {
        let path = paths::expand(raw);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }

    /// Catalog root: command line, then config, then `./capabilities`.
    pub fn catalog_dir(&self, cli: Option<&Path>) -> PathBuf {
        cli.map(Path::to_path_buf)
            .or_else(|| self.catalog.as_deref().map(|c| self.resolve(c)))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG))
    }

    /// State database: command line, then config, then the state directory.
    pub fn state_path(&self, cli: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = cli {
            return Ok(path.to_path_buf());
        }
        match &self.state {
            Some(state) => Ok(self.resolve(state)),
            None => paths::state_db(),
        }
    }

    pub fn inventory_path(&self) -> Option<PathBuf> {
        self.inventory.as_deref().map(|i| self.resolve(i))
    }

    /// Capability names a catalog may use.
    pub fn allowed_capabilities(&self) -> Vec<String> {
        if self.capabilities.is_empty() {
            DEFAULT_CAPABILITIES.iter().map(ToString::to_string).collect()
        } else {
            self.capabilities.clone()
        }
    }

    /// Parameter values as template text.
    pub fn parameters(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|(name, value)| {
                let text = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.clone(), text)
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
