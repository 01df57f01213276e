//! Operation definition types.
//!
//! Definitions are immutable input for the lifetime of a run. They are built
//! by a catalog loader (or directly in tests) and already carry rendered,
//! fully-substituted action text.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// How a rendered action is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Interpreter {
    Bash,
    BashScript,
    AzureCli,
    PowershellLocal,
    PowershellRemote,
    PowershellVmCommand,
}

impl Interpreter {
    /// All interpreters, in declaration order.
    pub const ALL: [Interpreter; 6] = [
        Self::Bash,
        Self::BashScript,
        Self::AzureCli,
        Self::PowershellLocal,
        Self::PowershellRemote,
        Self::PowershellVmCommand,
    ];

    /// Template type name as written in catalogs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::BashScript => "bash-script",
            Self::AzureCli => "azure-cli",
            Self::PowershellLocal => "powershell-local",
            Self::PowershellRemote => "powershell-remote",
            Self::PowershellVmCommand => "powershell-vm-command",
        }
    }

    /// Parse a template type name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.as_str() == name)
    }

    /// Whether the action runs under PowerShell.
    pub fn is_powershell(&self) -> bool {
        matches!(
            self,
            Self::PowershellLocal | Self::PowershellRemote | Self::PowershellVmCommand
        )
    }
}

impl fmt::Display for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-substituted action. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedAction {
    pub interpreter: Interpreter,
    pub command: String,
}

impl RenderedAction {
    pub fn new(interpreter: Interpreter, command: impl Into<String>) -> Self {
        Self {
            interpreter,
            command: command.into(),
        }
    }

    /// Shorthand for a bash action.
    pub fn bash(command: impl Into<String>) -> Self {
        Self::new(Interpreter::Bash, command)
    }
}

impl fmt::Display for RenderedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)
    }
}

/// Reference to a live resource known to discovery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ResourceRef {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            scope: None,
        }
    }

    pub fn in_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Whether two references point at the same resource.
    ///
    /// Type and name compare case-insensitively; a missing scope on either
    /// side matches any scope.
    pub fn matches(&self, other: &ResourceRef) -> bool {
        self.resource_type.eq_ignore_ascii_case(&other.resource_type)
            && self.name.eq_ignore_ascii_case(&other.name)
            && match (&self.scope, &other.scope) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                _ => true,
            }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}/{} ({})", self.resource_type, self.name, scope),
            None => write!(f, "{}/{}", self.resource_type, self.name),
        }
    }
}

/// Read-only probe deciding whether an operation's goal state already holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IdempotencyCheck {
    /// Run a command; exit 0 means "already done, skip"
    Command { action: RenderedAction },
    /// Ask discovery; a found resource means "already done, skip"
    ResourceExists { resource: ResourceRef },
}

/// Post-condition assertion run after an action exits 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationCheck {
    ExitCodeEquals {
        expected: i32,
    },
    ResourceExists {
        resource: ResourceRef,
    },
    PropertyEquals {
        resource: ResourceRef,
        path: String,
        expected: serde_json::Value,
    },
    ProvisioningStateEquals {
        resource: ResourceRef,
        expected: String,
    },
}

impl ValidationCheck {
    /// Check type names accepted in catalogs.
    pub const KINDS: [&'static str; 4] = [
        "exit_code_equals",
        "resource_exists",
        "property_equals",
        "provisioning_state_equals",
    ];

    /// Type name of this check.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExitCodeEquals { .. } => "exit_code_equals",
            Self::ResourceExists { .. } => "resource_exists",
            Self::PropertyEquals { .. } => "property_equals",
            Self::ProvisioningStateEquals { .. } => "provisioning_state_equals",
        }
    }

    /// Whether the check consults discovery (and may therefore be polled).
    pub fn uses_discovery(&self) -> bool {
        !matches!(self, Self::ExitCodeEquals { .. })
    }

    /// Resource the check looks up, if any.
    pub fn resource(&self) -> Option<&ResourceRef> {
        match self {
            Self::ExitCodeEquals { .. } => None,
            Self::ResourceExists { resource }
            | Self::PropertyEquals { resource, .. }
            | Self::ProvisioningStateEquals { resource, .. } => Some(resource),
        }
    }

    /// Whether `kind` names a known check type.
    pub fn is_known_kind(kind: &str) -> bool {
        Self::KINDS.contains(&kind)
    }
}

/// Bounded polling for discovery-backed validation checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Total tries, including the first
    pub attempts: u32,
    /// Pause between tries
    pub interval: Duration,
}

impl PollPolicy {
    /// Check once, never wait.
    pub const ONCE: PollPolicy = PollPolicy {
        attempts: 1,
        interval: Duration::ZERO,
    };

    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::ONCE
    }
}

/// A compensating action for a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackStep {
    pub name: String,
    pub action: RenderedAction,
    /// A failure of this step is tolerated rather than marking the rollback incomplete
    #[serde(default)]
    pub continue_on_error: bool,
    /// Overrides the operation timeout for this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl RollbackStep {
    pub fn new(name: impl Into<String>, action: RenderedAction) -> Self {
        Self {
            name: name.into(),
            action,
            continue_on_error: false,
            timeout: None,
        }
    }

    pub fn tolerate_failure(mut self) -> Self {
        self.continue_on_error = true;
        self
    }
}

/// Expected duration class of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DurationClass {
    Fast,
    Normal,
    Wait,
    Long,
}

impl DurationClass {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "FAST" => Some(Self::Fast),
            "NORMAL" => Some(Self::Normal),
            "WAIT" => Some(Self::Wait),
            "LONG" => Some(Self::Long),
            _ => None,
        }
    }
}

/// Expected duration and hard timeout of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationSpec {
    pub expected: Duration,
    pub timeout: Duration,
    pub class: DurationClass,
}

impl Default for DurationSpec {
    fn default() -> Self {
        Self {
            expected: Duration::from_secs(60),
            timeout: Duration::from_secs(300),
            class: DurationClass::Normal,
        }
    }
}

/// What kind of change an operation makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Create,
    Configure,
    Validate,
    Update,
    Delete,
    Read,
    Modify,
    Adopt,
    Assign,
    Verify,
    Add,
    Remove,
    Drain,
}

impl OperationMode {
    pub const ALL: [OperationMode; 13] = [
        Self::Create,
        Self::Configure,
        Self::Validate,
        Self::Update,
        Self::Delete,
        Self::Read,
        Self::Modify,
        Self::Adopt,
        Self::Assign,
        Self::Verify,
        Self::Add,
        Self::Remove,
        Self::Drain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Configure => "configure",
            Self::Validate => "validate",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Read => "read",
            Self::Modify => "modify",
            Self::Adopt => "adopt",
            Self::Assign => "assign",
            Self::Verify => "verify",
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Drain => "drain",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

/// A declared unit of provisioning work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Category tag (networking, storage, identity, ...)
    pub capability: String,
    pub mode: OperationMode,
    #[serde(default)]
    pub resource_type: String,
    /// Resource this operation provisions, used to map discovered relationships
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ResourceRef>,
    /// Ids that must reach terminal success first
    #[serde(default)]
    pub requires: BTreeSet<String>,
    pub action: RenderedAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency: Option<IdempotencyCheck>,
    #[serde(default)]
    pub validation: Vec<ValidationCheck>,
    #[serde(default)]
    pub validation_poll: PollPolicy,
    #[serde(default)]
    pub rollback: Vec<RollbackStep>,
    #[serde(default)]
    pub duration: DurationSpec,
    /// A failure is reported but does not halt the run
    #[serde(default)]
    pub continue_on_error: bool,
}

impl OperationDefinition {
    /// Create a definition with defaults; the id doubles as the name.
    pub fn new(id: impl Into<String>, action: RenderedAction) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            capability: "general".to_string(),
            mode: OperationMode::Create,
            resource_type: String::new(),
            target: None,
            requires: BTreeSet::new(),
            action,
            idempotency: None,
            validation: Vec::new(),
            validation_poll: PollPolicy::ONCE,
            rollback: Vec::new(),
            duration: DurationSpec::default(),
            continue_on_error: false,
        }
    }

    pub fn requires<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = capability.into();
        self
    }

    pub fn with_target(mut self, target: ResourceRef) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_idempotency(mut self, check: IdempotencyCheck) -> Self {
        self.idempotency = Some(check);
        self
    }

    pub fn with_validation(mut self, check: ValidationCheck) -> Self {
        self.validation.push(check);
        self
    }

    pub fn with_rollback(mut self, step: RollbackStep) -> Self {
        self.rollback.push(step);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.duration.timeout = timeout;
        if self.duration.expected > timeout {
            self.duration.expected = timeout;
        }
        self
    }

    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpreter_names_round_trip() {
        for interpreter in Interpreter::ALL {
            assert_eq!(Interpreter::parse(interpreter.as_str()), Some(interpreter));
        }
        assert_eq!(Interpreter::parse("cmd.exe"), None);
        assert!(Interpreter::PowershellRemote.is_powershell());
        assert!(!Interpreter::AzureCli.is_powershell());
    }

    #[test]
    fn test_resource_ref_matching() {
        let declared = ResourceRef::new("Microsoft.Network/virtualNetworks", "hub-vnet");
        let live = ResourceRef::new("microsoft.network/virtualnetworks", "HUB-VNET").in_scope("rg-core");

        assert!(declared.matches(&live));
        assert!(live.matches(&declared));
        assert!(!live.matches(&ResourceRef::new("microsoft.network/virtualnetworks", "hub-vnet").in_scope("rg-edge")));
    }

    #[test]
    fn test_validation_kinds() {
        let check = ValidationCheck::ProvisioningStateEquals {
            resource: ResourceRef::new("vm", "web-01"),
            expected: "Succeeded".to_string(),
        };
        assert_eq!(check.kind(), "provisioning_state_equals");
        assert!(check.uses_discovery());
        assert!(ValidationCheck::is_known_kind("property_equals"));
        assert!(!ValidationCheck::is_known_kind("regex_matches"));
    }

    #[test]
    fn test_with_timeout_clamps_expected() {
        let def = OperationDefinition::new("a", RenderedAction::bash("true"))
            .with_timeout(Duration::from_secs(10));
        assert_eq!(def.duration.timeout, Duration::from_secs(10));
        assert_eq!(def.duration.expected, Duration::from_secs(10));
    }

    #[test]
    fn test_poll_policy_never_zero_attempts() {
        assert_eq!(PollPolicy::new(0, Duration::ZERO).attempts, 1);
    }
}
