//! Operation catalog.
//!
//! Operations live one per file at `<root>/<capability>/operations/*.yaml`,
//! each a single `operation:` document. Loading happens in two passes: every
//! file is checked against the catalog schema and reported, then valid files
//! are rendered into [`OperationDefinition`]s.

use crate::render::Renderer;
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use walkdir::WalkDir;
use workflow::{
    ConfigError, DependencyGraph, DurationClass, DurationSpec, GraphStats, IdempotencyCheck,
    Interpreter, OperationDefinition, OperationMode, PollPolicy, RenderedAction, ResourceRef,
    RollbackStep, ValidationCheck,
};

const REQUIRED_FIELDS: &[&str] = &[
    "operation.id",
    "operation.name",
    "operation.description",
    "operation.capability",
    "operation.operation_mode",
    "operation.resource_type",
    "operation.duration.expected",
    "operation.duration.timeout",
    "operation.duration.type",
    "operation.template.type",
    "operation.template.command",
];

const OPTIONAL_BOOLEAN_FIELDS: &[&str] = &[
    "operation.validation.enabled",
    "operation.idempotency.enabled",
    "operation.rollback.enabled",
    "operation.continue_on_error",
];

const DURATION_CLASSES: &[&str] = &["FAST", "NORMAL", "WAIT", "LONG"];

/// Catalog problems that stop planning.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no operation files found under {}", .0.display())]
    Empty(PathBuf),

    #[error("{count} catalog file(s) failed schema validation; first: {first}")]
    Invalid { count: usize, first: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ============================================================================
// Document Schema
// ============================================================================

#[derive(Debug, Deserialize)]
struct Document {
    operation: RawOperation,
}

/// An operation as written in a catalog file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOperation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub capability: String,
    pub operation_mode: OperationMode,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub requires: Vec<Requirement>,
    #[serde(default)]
    pub target: Option<RawResource>,
    pub duration: RawDuration,
    pub template: RawTemplate,
    #[serde(default)]
    pub parameters: Option<RawParameters>,
    #[serde(default)]
    pub idempotency: Option<RawIdempotency>,
    #[serde(default)]
    pub validation: Option<RawValidation>,
    #[serde(default)]
    pub rollback: Option<RawRollback>,
    #[serde(default)]
    pub continue_on_error: bool,
}

/// A predecessor, either a bare id or `{operation: id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Requirement {
    Id(String),
    Detailed { operation: String },
}

impl Requirement {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) | Self::Detailed { operation: id } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDuration {
    pub expected: u64,
    pub timeout: u64,
    #[serde(rename = "type")]
    pub class: DurationClass,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTemplate {
    #[serde(rename = "type")]
    pub interpreter: Interpreter,
    pub command: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawParameters {
    #[serde(default)]
    pub required: Vec<RawParameter>,
    #[serde(default)]
    pub optional: Vec<RawParameter>,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Deserialize)]
pub struct RawParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawResource {
    /// Defaults to the operation's `resource_type`
    #[serde(default, rename = "type")]
    pub resource_type: Option<String>,
    pub name: String,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawIdempotency {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub check_command: Option<String>,
    #[serde(default)]
    pub template_type: Option<Interpreter>,
    #[serde(default)]
    pub resource_exists: Option<RawResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawValidation {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub checks: Vec<Value>,
    #[serde(default)]
    pub post_checks: Vec<Value>,
    #[serde(default)]
    pub poll: Option<RawPoll>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RawPoll {
    pub attempts: u32,
    #[serde(default)]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRollback {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub steps: Vec<RawRollbackStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRollbackStep {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub template_type: Option<Interpreter>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
}

const fn enabled() -> bool {
    true
}

// ============================================================================
// Loading
// ============================================================================

/// Result of checking one catalog file.
#[derive(Debug, Clone)]
pub struct FileReport {
    pub path: PathBuf,
    /// Operation id, when the document has one
    pub id: Option<String>,
    /// Declared predecessors, read even from invalid documents
    pub requires: Vec<String>,
    pub errors: Vec<String>,
    pub operation: Option<RawOperation>,
}

impl FileReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Every operation file found under a catalog root.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub root: PathBuf,
    pub files: Vec<FileReport>,
}

/// Settings applied while turning catalog entries into definitions.
#[derive(Debug, Clone, Copy)]
pub struct DefinitionDefaults {
    pub poll: PollPolicy,
}

impl Default for DefinitionDefaults {
    fn default() -> Self {
        Self {
            poll: PollPolicy::ONCE,
        }
    }
}

/// Operation files under `root`, sorted. A file path is returned as is.
pub fn discover(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        anyhow::bail!("Catalog path does not exist: {}", root.display());
    }
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| {
            p.parent()
                .and_then(Path::file_name)
                .is_some_and(|n| n == "operations")
                && p.extension().is_some_and(|e| e == "yaml" || e == "yml")
        })
        .collect();
    files.sort();
    Ok(files)
}

impl Catalog {
    /// Find and check every operation file under `root`.
    pub fn load(root: &Path, capabilities: &[String]) -> Result<Self> {
        let paths = discover(root)?;
        log::debug!("Checking {} catalog file(s) under {}", paths.len(), root.display());

        let files = paths
            .par_iter()
            .map(|path| check_file(path, capabilities))
            .collect();

        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.files.iter().all(FileReport::is_valid)
    }

    pub fn invalid(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| !f.is_valid())
    }

    /// Render every operation into a definition.
    ///
    /// Fails if any file is invalid or any operation cannot be rendered.
    pub fn definitions(
        &self,
        renderer: &Renderer,
        defaults: DefinitionDefaults,
    ) -> Result<Vec<OperationDefinition>, CatalogError> {
        if self.files.is_empty() {
            return Err(CatalogError::Empty(self.root.clone()));
        }
        let invalid: Vec<&FileReport> = self.invalid().collect();
        if let Some(first) = invalid.first() {
            return Err(CatalogError::Invalid {
                count: invalid.len(),
                first: format!("{}: {}", first.path.display(), first.errors.join("; ")),
            });
        }

        let mut definitions = Vec::with_capacity(self.files.len());
        for op in self.files.iter().filter_map(|f| f.operation.as_ref()) {
            definitions.push(op.to_definition(renderer, defaults)?);
        }
        Ok(definitions)
    }
}

/// Check one file against the catalog schema.
pub fn check_file(path: &Path, capabilities: &[String]) -> FileReport {
    let mut report = FileReport {
        path: path.to_path_buf(),
        id: None,
        requires: Vec::new(),
        errors: Vec::new(),
        operation: None,
    };

    let content = match std::fs::read_to_string(path)
        .with_context(|| format!("Could not read {}", path.display()))
    {
        Ok(content) => content,
        Err(e) => {
            report.errors.push(format!("{e:#}"));
            return report;
        }
    };

    let value: Value = match serde_yaml::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            report.errors.push(format!("YAML parsing error: {e}"));
            return report;
        }
    };

    report.id = lookup(&value, "operation.id")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    report.requires = requirement_ids(&value);
    report.errors = schema_errors(&value, capabilities);

    if report.errors.is_empty() {
        match serde_yaml::from_value::<Document>(value) {
            Ok(doc) => report.operation = Some(doc.operation),
            Err(e) => report.errors.push(format!("Invalid operation document: {e}")),
        }
    }
    report
}

// ============================================================================
// Schema Checks
// ============================================================================

fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(value, |current, part| current.get(part))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "dict",
        Value::Tagged(_) => "tagged",
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn check_enum(errors: &mut Vec<String>, field: &str, value: Option<&Value>, allowed: &[&str]) {
    let Some(value) = value else { return };
    let text = value.as_str().unwrap_or_default();
    if !allowed.contains(&text) {
        errors.push(format!(
            "Invalid {field}: '{}' (must be one of: {})",
            value.as_str().map_or_else(|| type_name(value).to_string(), ToString::to_string),
            allowed.join(", ")
        ));
    }
}

fn requirement_ids(value: &Value) -> Vec<String> {
    lookup(value, "operation.requires")
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(|r| {
                    r.as_str()
                        .or_else(|| r.get("operation").and_then(Value::as_str))
                        .map(ToString::to_string)
                })
                .filter(|id| !id.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Every schema violation in an operation document.
pub fn schema_errors(value: &Value, capabilities: &[String]) -> Vec<String> {
    let mut errors = Vec::new();

    if is_blank(value) {
        errors.push("Empty or invalid YAML file".to_string());
        return errors;
    }

    for field in REQUIRED_FIELDS {
        match lookup(value, field) {
            None => errors.push(format!("Missing required field: {field}")),
            Some(v) if is_blank(v) => errors.push(format!("Empty value for required field: {field}")),
            Some(_) => {}
        }
    }

    let modes: Vec<&str> = OperationMode::ALL.iter().map(OperationMode::as_str).collect();
    check_enum(&mut errors, "operation_mode", lookup(value, "operation.operation_mode"), &modes);

    let caps: Vec<&str> = capabilities.iter().map(String::as_str).collect();
    check_enum(&mut errors, "capability", lookup(value, "operation.capability"), &caps);

    check_enum(&mut errors, "duration.type", lookup(value, "operation.duration.type"), DURATION_CLASSES);
    check_durations(&mut errors, value);

    let interpreters: Vec<&str> = Interpreter::ALL.iter().map(Interpreter::as_str).collect();
    check_enum(&mut errors, "template.type", lookup(value, "operation.template.type"), &interpreters);

    for field in OPTIONAL_BOOLEAN_FIELDS {
        if let Some(v) = lookup(value, field).filter(|v| !v.is_null()) {
            if !v.is_bool() {
                let short = field.trim_start_matches("operation.");
                errors.push(format!("{short} must be boolean, got: {}", type_name(v)));
            }
        }
    }

    if let Some(requires) = lookup(value, "operation.requires") {
        if !requires.is_sequence() && !requires.is_null() {
            errors.push("operation.requires must be a list".to_string());
        }
    }

    check_parameters(&mut errors, value);
    check_rollback(&mut errors, value);
    check_validation(&mut errors, value);
    errors
}

fn check_durations(errors: &mut Vec<String>, value: &Value) {
    let mut ints = BTreeMap::new();
    for key in ["expected", "timeout"] {
        let Some(v) = lookup(value, &format!("operation.duration.{key}")) else {
            continue;
        };
        if is_blank(v) {
            continue;
        }
        match v.as_i64() {
            Some(n) if n <= 0 => errors.push(format!("duration.{key} must be positive, got: {n}")),
            Some(n) => {
                ints.insert(key, n);
            }
            None => errors.push(format!("duration.{key} must be integer, got: {}", type_name(v))),
        }
    }
    if let (Some(expected), Some(timeout)) = (ints.get("expected"), ints.get("timeout")) {
        if timeout < expected {
            errors.push(format!(
                "duration.timeout ({timeout}) should be >= duration.expected ({expected})"
            ));
        }
    }
}

fn check_parameters(errors: &mut Vec<String>, value: &Value) {
    let Some(params) = lookup(value, "operation.parameters") else {
        return;
    };
    if !params.is_mapping() {
        errors.push("operation.parameters must be a dictionary".to_string());
        return;
    }
    if params.get("required").is_none() && params.get("optional").is_none() {
        errors.push("operation.parameters should have 'required' and/or 'optional' keys".to_string());
    }
    for group in ["required", "optional"] {
        let Some(list) = params.get(group) else { continue };
        let Some(items) = list.as_sequence() else {
            errors.push(format!("operation.parameters.{group} must be a list"));
            continue;
        };
        for (i, param) in items.iter().enumerate() {
            if !param.is_mapping() {
                errors.push(format!("operation.parameters.{group}[{i}] must be a dictionary"));
                continue;
            }
            for key in ["name", "type", "description"] {
                if param.get(key).is_none() {
                    errors.push(format!("operation.parameters.{group}[{i}] missing '{key}'"));
                }
            }
        }
    }
}

fn check_rollback(errors: &mut Vec<String>, value: &Value) {
    let Some(rollback) = lookup(value, "operation.rollback") else {
        return;
    };
    if !rollback.is_mapping() {
        errors.push("operation.rollback must be a dictionary".to_string());
        return;
    }
    if rollback.get("enabled").and_then(Value::as_bool) == Some(false) {
        return;
    }
    let Some(steps) = rollback.get("steps") else {
        if rollback.get("enabled").and_then(Value::as_bool) == Some(true) {
            errors.push("operation.rollback.steps required when enabled=true".to_string());
        }
        return;
    };
    let Some(steps) = steps.as_sequence() else {
        errors.push("operation.rollback.steps must be a list".to_string());
        return;
    };
    for (i, step) in steps.iter().enumerate() {
        if !step.is_mapping() {
            errors.push(format!("operation.rollback.steps[{i}] must be a dictionary"));
            continue;
        }
        for key in ["name", "command"] {
            if step.get(key).is_none() {
                errors.push(format!("operation.rollback.steps[{i}] missing '{key}'"));
            }
        }
        if let Some(t) = step.get("timeout") {
            if t.as_u64().is_none_or(|n| n == 0) {
                errors.push(format!(
                    "operation.rollback.steps[{i}].timeout must be a positive integer"
                ));
            }
        }
    }
}

fn check_validation(errors: &mut Vec<String>, value: &Value) {
    let Some(validation) = lookup(value, "operation.validation") else {
        return;
    };
    if !validation.is_mapping() {
        errors.push("operation.validation must be a dictionary".to_string());
        return;
    }
    let has_target = lookup(value, "operation.target").is_some_and(Value::is_mapping);
    for key in ["checks", "pre_checks", "post_checks"] {
        let Some(list) = validation.get(key) else { continue };
        let Some(items) = list.as_sequence() else {
            errors.push(format!("operation.validation.{key} must be a list"));
            continue;
        };
        if key == "pre_checks" {
            continue;
        }
        for (i, check) in items.iter().enumerate() {
            match check.get("type").and_then(Value::as_str) {
                None => errors.push(format!("operation.validation.{key}[{i}] missing 'type'")),
                Some(kind) if !ValidationCheck::is_known_kind(kind) => errors.push(format!(
                    "operation.validation.{key}[{i}] has unknown type '{kind}' (must be one of: {})",
                    ValidationCheck::KINDS.join(", ")
                )),
                Some(kind) => {
                    if let Some(reason) = check_field_problem(kind, check) {
                        errors.push(format!("operation.validation.{key}[{i}] ({kind}): {reason}"));
                    } else if kind != "exit_code_equals"
                        && check.get("resource").is_none()
                        && !has_target
                    {
                        errors.push(format!(
                            "operation.validation.{key}[{i}] needs 'resource' or an operation target"
                        ));
                    }
                }
            }
        }
    }
}

fn property_path(check: &Value) -> Option<&str> {
    check
        .get("path")
        .or_else(|| check.get("property"))
        .and_then(Value::as_str)
        .filter(|p| !p.trim().is_empty())
}

/// Problem with the fields of a check whose type is known, if any.
fn check_field_problem(kind: &str, check: &Value) -> Option<String> {
    if let Some(resource) = check.get("resource") {
        if let Err(err) = serde_yaml::from_value::<RawResource>(resource.clone()) {
            return Some(format!("'resource' is malformed: {err}"));
        }
    }
    let expected = check.get("expected");
    match kind {
        "exit_code_equals" => match expected {
            None => Some("'expected' is required".to_string()),
            Some(v) if v.as_i64().and_then(|n| i32::try_from(n).ok()).is_none() => {
                Some("'expected' must be an integer exit code".to_string())
            }
            Some(_) => None,
        },
        "property_equals" if property_path(check).is_none() => {
            Some("'path' must be a non-empty string".to_string())
        }
        "property_equals" if expected.is_none() => Some("'expected' is required".to_string()),
        "provisioning_state_equals" if expected.is_some_and(|v| !v.is_string()) => {
            Some("'expected' must be a string".to_string())
        }
        _ => None,
    }
}

// ============================================================================
// Rendering
// ============================================================================

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl RawOperation {
    fn resource(
        &self,
        raw: &RawResource,
        renderer: &Renderer,
    ) -> Result<ResourceRef, ConfigError> {
        let resource_type = raw
            .resource_type
            .clone()
            .unwrap_or_else(|| self.resource_type.clone());
        let mut resource = ResourceRef::new(resource_type, renderer.render(&self.id, &raw.name)?);
        if let Some(scope) = &raw.scope {
            resource = resource.in_scope(renderer.render(&self.id, scope)?);
        }
        Ok(resource)
    }

    fn invalid_check(&self, kind: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidCheck {
            operation: self.id.clone(),
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }

    /// Resource named by a check, falling back to the operation target.
    fn check_resource(
        &self,
        kind: &str,
        check: &Value,
        renderer: &Renderer,
    ) -> Result<ResourceRef, ConfigError> {
        let raw = match check.get("resource") {
            Some(value) => serde_yaml::from_value::<RawResource>(value.clone())
                .map_err(|e| self.invalid_check(kind, format!("'resource' is malformed: {e}")))?,
            None => self
                .target
                .clone()
                .ok_or_else(|| self.invalid_check(kind, "needs 'resource' or an operation target"))?,
        };
        self.resource(&raw, renderer)
    }

    fn validation_check(
        &self,
        check: &Value,
        renderer: &Renderer,
    ) -> Result<ValidationCheck, ConfigError> {
        let kind = check.get("type").and_then(Value::as_str).unwrap_or_default();
        if !ValidationCheck::is_known_kind(kind) {
            return Err(ConfigError::UnknownCheckType {
                operation: self.id.clone(),
                kind: kind.to_string(),
            });
        }
        if let Some(reason) = check_field_problem(kind, check) {
            return Err(self.invalid_check(kind, reason));
        }

        let expected = check.get("expected");
        match kind {
            "exit_code_equals" => {
                let code = expected
                    .and_then(Value::as_i64)
                    .and_then(|n| i32::try_from(n).ok())
                    .ok_or_else(|| self.invalid_check(kind, "'expected' must be an integer exit code"))?;
                Ok(ValidationCheck::ExitCodeEquals { expected: code })
            }
            "resource_exists" => Ok(ValidationCheck::ResourceExists {
                resource: self.check_resource(kind, check, renderer)?,
            }),
            "property_equals" => {
                let path = property_path(check)
                    .ok_or_else(|| self.invalid_check(kind, "'path' must be a non-empty string"))?
                    .to_string();
                let expected = match expected.and_then(scalar_text) {
                    Some(text) => serde_json::Value::String(renderer.render(&self.id, &text)?),
                    None => expected
                        .and_then(|v| serde_json::to_value(v).ok())
                        .unwrap_or(serde_json::Value::Null),
                };
                Ok(ValidationCheck::PropertyEquals {
                    resource: self.check_resource(kind, check, renderer)?,
                    path,
                    expected,
                })
            }
            _ => Ok(ValidationCheck::ProvisioningStateEquals {
                resource: self.check_resource(kind, check, renderer)?,
                expected: expected
                    .and_then(Value::as_str)
                    .unwrap_or("Succeeded")
                    .to_string(),
            }),
        }
    }

    /// Render into a definition the engine can run.
    pub fn to_definition(
        &self,
        renderer: &Renderer,
        defaults: DefinitionDefaults,
    ) -> Result<OperationDefinition, ConfigError> {
        let params = self.parameters.clone().unwrap_or_default();
        let defaulted: Vec<(&str, String)> = params
            .optional
            .iter()
            .filter_map(|p| Some((p.name.as_str(), scalar_text(p.default.as_ref()?)?)))
            .collect();
        let renderer = renderer.with_defaults(defaulted.iter().map(|(n, t)| (*n, t.as_str())));

        for required in &params.required {
            renderer.render(&self.id, &format!("{{{{{}}}}}", required.name))?;
        }

        let command = renderer.render(&self.id, &self.template.command)?;
        let mut def = OperationDefinition::new(
            self.id.clone(),
            RenderedAction::new(self.template.interpreter, command),
        );
        def.name = self.name.clone();
        def.description = self.description.trim().to_string();
        def.capability = self.capability.clone();
        def.mode = self.operation_mode;
        def.resource_type = self.resource_type.clone();
        def.requires = self
            .requires
            .iter()
            .map(|r| r.id().to_string())
            .collect::<BTreeSet<_>>();
        def.duration = DurationSpec {
            expected: Duration::from_secs(self.duration.expected),
            timeout: Duration::from_secs(self.duration.timeout),
            class: self.duration.class,
        };
        def.continue_on_error = self.continue_on_error;

        if let Some(target) = &self.target {
            def.target = Some(self.resource(target, &renderer)?);
        }

        if let Some(idem) = self.idempotency.as_ref().filter(|i| i.enabled) {
            def.idempotency = if let Some(resource) = &idem.resource_exists {
                Some(IdempotencyCheck::ResourceExists {
                    resource: self.resource(resource, &renderer)?,
                })
            } else if let Some(check) = &idem.check_command {
                Some(IdempotencyCheck::Command {
                    action: RenderedAction::new(
                        idem.template_type.unwrap_or(self.template.interpreter),
                        renderer.render(&self.id, check)?,
                    ),
                })
            } else {
                None
            };
        }

        if let Some(validation) = self.validation.as_ref().filter(|v| v.enabled) {
            for check in validation.checks.iter().chain(&validation.post_checks) {
                def.validation.push(self.validation_check(check, &renderer)?);
            }
            def.validation_poll = validation.poll.map_or(defaults.poll, |p| {
                PollPolicy::new(p.attempts, Duration::from_secs(p.interval_secs))
            });
        }

        if let Some(rollback) = self.rollback.as_ref().filter(|r| r.enabled) {
            for step in &rollback.steps {
                let action = RenderedAction::new(
                    step.template_type.unwrap_or(self.template.interpreter),
                    renderer.render(&self.id, &step.command)?,
                );
                let mut rendered = RollbackStep::new(step.name.clone(), action);
                rendered.continue_on_error = step.continue_on_error;
                rendered.timeout = step.timeout.map(Duration::from_secs);
                def.rollback.push(rendered);
            }
        }

        Ok(def)
    }
}

// ============================================================================
// Dependency Report
// ============================================================================

/// A predecessor reference that names no operation in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    pub operation: String,
    pub missing: String,
    pub file: PathBuf,
}

/// Dependency findings across a whole catalog.
#[derive(Debug, Clone, Default)]
pub struct DependencyReport {
    pub loaded: usize,
    pub duplicates: Vec<(String, Vec<PathBuf>)>,
    pub missing: Vec<MissingDependency>,
    pub cycles: Vec<Vec<String>>,
    pub stats: GraphStats,
}

impl DependencyReport {
    pub fn has_errors(&self) -> bool {
        !self.duplicates.is_empty() || !self.missing.is_empty() || !self.cycles.is_empty()
    }
}

impl Catalog {
    /// Check predecessor references and cycles, using every file with an id.
    pub fn dependency_report(&self) -> DependencyReport {
        let mut report = DependencyReport::default();
        let mut by_id: BTreeMap<&str, Vec<&FileReport>> = BTreeMap::new();
        for file in &self.files {
            if let Some(id) = file.id.as_deref() {
                by_id.entry(id).or_default().push(file);
            }
        }
        report.loaded = by_id.len();

        for (id, files) in &by_id {
            if files.len() > 1 {
                report
                    .duplicates
                    .push(((*id).to_string(), files.iter().map(|f| f.path.clone()).collect()));
            }
        }

        let mut definitions = Vec::with_capacity(by_id.len());
        for (id, files) in &by_id {
            let file = files[0];
            let mut requires = BTreeSet::new();
            for required in &file.requires {
                if required.as_str() == *id {
                    report.cycles.push(vec![(*id).to_string()]);
                } else if by_id.contains_key(required.as_str()) {
                    requires.insert(required.clone());
                } else {
                    report.missing.push(MissingDependency {
                        operation: (*id).to_string(),
                        missing: required.clone(),
                        file: file.path.clone(),
                    });
                }
            }
            let mut def = OperationDefinition::new(*id, RenderedAction::bash(""));
            def.requires = requires;
            definitions.push(def);
        }

        if let Ok(graph) = DependencyGraph::build(&definitions) {
            if let Some(cycle) = graph.find_cycle() {
                report.cycles.push(cycle);
            }
            report.stats = graph.stats();
        }
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    pub(crate) const RG: &str = r#"
operation:
  id: create-rg
  name: Create resource group
  description: Resource group for the deployment
  capability: management
  operation_mode: create
  resource_type: Microsoft.Resources/resourceGroups
  target:
    name: "{{RESOURCE_GROUP}}"
  duration:
    expected: 10
    timeout: 60
    type: FAST
  template:
    type: azure-cli
    command: az group create -n {{RESOURCE_GROUP}} -l {{LOCATION}}
  parameters:
    required:
      - name: RESOURCE_GROUP
        type: string
        description: Resource group name
    optional:
      - name: LOCATION
        type: string
        description: Azure region
        default: westeurope
  idempotency:
    enabled: true
    check_command: az group show -n {{RESOURCE_GROUP}}
  validation:
    enabled: true
    checks:
      - type: exit_code_equals
        expected: 0
      - type: provisioning_state_equals
  rollback:
    enabled: true
    steps:
      - name: Delete resource group
        command: az group delete -n {{RESOURCE_GROUP}} --yes
        timeout: 600
"#;

    pub(crate) const VNET: &str = r#"
operation:
  id: create-vnet
  name: Create hub VNet
  description: Hub virtual network
  capability: networking
  operation_mode: create
  resource_type: Microsoft.Network/virtualNetworks
  requires:
    - create-rg
  target:
    name: vnet-hub
    scope: "{{RESOURCE_GROUP}}"
  duration:
    expected: 30
    timeout: 120
    type: NORMAL
  template:
    type: bash
    command: az network vnet create -g {{RESOURCE_GROUP}} -n vnet-hub
  validation:
    checks:
      - type: property_equals
        path: properties.addressSpace.addressPrefixes[0]
        expected: 10.0.0.0/16
    poll:
      attempts: 3
      interval_secs: 0
  rollback:
    steps:
      - name: Delete VNet
        command: az network vnet delete -g {{RESOURCE_GROUP}} -n vnet-hub
        continue_on_error: true
"#;

    pub(crate) fn write_op(root: &Path, capability: &str, file: &str, content: &str) -> PathBuf {
        let dir = root.join(capability).join("operations");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub(crate) fn caps() -> Vec<String> {
        crate::config::DEFAULT_CAPABILITIES
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub(crate) fn renderer() -> Renderer {
        Renderer::new(BTreeMap::from([(
            "RESOURCE_GROUP".to_string(),
            "rg-prod".to_string(),
        )]))
    }

    fn sample() -> (TempDir, Catalog) {
        let dir = TempDir::new().unwrap();
        write_op(dir.path(), "management", "01-rg.yaml", RG);
        write_op(dir.path(), "networking", "01-vnet.yaml", VNET);
        std::fs::write(dir.path().join("README.md"), "not an operation").unwrap();
        let catalog = Catalog::load(dir.path(), &caps()).unwrap();
        (dir, catalog)
    }

    #[test]
    fn test_discover_only_operation_files() {
        let (dir, catalog) = sample();
        let names: Vec<_> = catalog
            .files
            .iter()
            .map(|f| f.path.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("management/operations/01-rg.yaml"),
                PathBuf::from("networking/operations/01-vnet.yaml"),
            ]
        );
        assert!(catalog.is_valid());
    }

    #[test]
    fn test_definitions_are_rendered() {
        let (_dir, catalog) = sample();
        let defs = catalog.definitions(&renderer(), DefinitionDefaults::default()).unwrap();
        let rg = &defs[0];

        assert_eq!(rg.id, "create-rg");
        assert_eq!(rg.action.interpreter, Interpreter::AzureCli);
        assert_eq!(rg.action.command, "az group create -n rg-prod -l westeurope");
        assert_eq!(rg.duration.timeout, Duration::from_secs(60));
        assert_eq!(rg.duration.class, DurationClass::Fast);
        assert_eq!(
            rg.target,
            Some(ResourceRef::new("Microsoft.Resources/resourceGroups", "rg-prod"))
        );
        assert_eq!(
            rg.idempotency,
            Some(IdempotencyCheck::Command {
                action: RenderedAction::new(Interpreter::AzureCli, "az group show -n rg-prod"),
            })
        );
        assert_eq!(rg.validation.len(), 2);
        assert_eq!(rg.validation[1].kind(), "provisioning_state_equals");
        assert_eq!(rg.rollback[0].timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_checks_default_to_operation_target() {
        let (_dir, catalog) = sample();
        let defs = catalog.definitions(&renderer(), DefinitionDefaults::default()).unwrap();
        let vnet = &defs[1];

        assert_eq!(vnet.requires, BTreeSet::from(["create-rg".to_string()]));
        assert_eq!(
            vnet.validation[0],
            ValidationCheck::PropertyEquals {
                resource: ResourceRef::new("Microsoft.Network/virtualNetworks", "vnet-hub")
                    .in_scope("rg-prod"),
                path: "properties.addressSpace.addressPrefixes[0]".to_string(),
                expected: serde_json::json!("10.0.0.0/16"),
            }
        );
        assert_eq!(vnet.validation_poll.attempts, 3);
        assert!(vnet.rollback[0].continue_on_error);
    }

    #[test]
    fn test_missing_required_parameter_is_unresolved() {
        let (_dir, catalog) = sample();
        let err = catalog
            .definitions(&Renderer::default(), DefinitionDefaults::default())
            .unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Config(ConfigError::UnresolvedPlaceholder { ref operation, ref placeholder })
                if operation == "create-rg" && placeholder == "RESOURCE_GROUP"
        ));
    }

    #[test]
    fn test_schema_errors_are_reported_per_file() {
        let dir = TempDir::new().unwrap();
        let path = write_op(
            dir.path(),
            "storage",
            "bad.yaml",
            r#"
operation:
  id: bad
  name: Bad
  description: ""
  capability: space
  operation_mode: explode
  resource_type: x
  duration:
    expected: 100
    timeout: 50
    type: SOMETIME
  template:
    type: cmd
    command: echo
  rollback:
    enabled: true
"#,
        );
        let report = check_file(&path, &caps());
        let errors = report.errors.join("\n");

        assert!(errors.contains("Empty value for required field: operation.description"));
        assert!(errors.contains("Invalid operation_mode: 'explode'"));
        assert!(errors.contains("Invalid capability: 'space'"));
        assert!(errors.contains("Invalid duration.type: 'SOMETIME'"));
        assert!(errors.contains("duration.timeout (50) should be >= duration.expected (100)"));
        assert!(errors.contains("Invalid template.type: 'cmd'"));
        assert!(errors.contains("operation.rollback.steps required when enabled=true"));
        assert!(report.operation.is_none());
        assert_eq!(report.id.as_deref(), Some("bad"));
    }

    #[test]
    fn test_unknown_check_type_is_rejected() {
        let dir = TempDir::new().unwrap();
        let content = RG.replace("type: provisioning_state_equals", "type: dns_resolves");
        let path = write_op(dir.path(), "management", "rg.yaml", &content);

        let report = check_file(&path, &caps());
        assert!(report.errors.iter().any(|e| e.contains("unknown type 'dns_resolves'")));

        let catalog = Catalog::load(dir.path(), &caps()).unwrap();
        assert!(matches!(
            catalog.definitions(&renderer(), DefinitionDefaults::default()),
            Err(CatalogError::Invalid { count: 1, .. })
        ));
    }

    #[test]
    fn test_unknown_check_type_in_conversion() {
        let (_dir, catalog) = sample();
        let mut op = catalog.files[0].operation.clone().unwrap();
        op.validation.as_mut().unwrap().checks[0] =
            serde_yaml::from_str("type: dns_resolves").unwrap();
        let err = op.to_definition(&renderer(), DefinitionDefaults::default()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownCheckType {
                operation: "create-rg".to_string(),
                kind: "dns_resolves".to_string(),
            }
        );
    }

    const NSG_TYPO: &str = "      - type: resource_exists
        resource:
          type: Microsoft.Network/networkSecurityGroups
          nmae: nsg-web
";

    #[test]
    fn test_malformed_check_resource_is_a_schema_error() {
        let dir = TempDir::new().unwrap();
        let content = VNET.replace(
            "      - type: property_equals
        path: properties.addressSpace.addressPrefixes[0]
        expected: 10.0.0.0/16
",
            NSG_TYPO,
        );
        let path = write_op(dir.path(), "networking", "vnet.yaml", &content);

        let report = check_file(&path, &caps());
        assert!(
            report
                .errors
                .iter()
                .any(|e| e.contains("(resource_exists): 'resource' is malformed"))
        );
    }

    fn convert_with_check(check: &str) -> Result<OperationDefinition, ConfigError> {
        let (_dir, catalog) = sample();
        let mut op = catalog.files[0].operation.clone().unwrap();
        op.validation.as_mut().unwrap().checks[0] = serde_yaml::from_str(check).unwrap();
        op.to_definition(&renderer(), DefinitionDefaults::default())
    }

    #[test]
    fn test_malformed_check_resource_does_not_fall_back_to_target() {
        for check in [
            "{type: resource_exists, resource: {type: Microsoft.Network/networkSecurityGroups, nmae: nsg-web}}",
            "{type: provisioning_state_equals, resource: nsg-web}",
        ] {
            let err = convert_with_check(check).unwrap_err();
            assert!(
                matches!(&err, ConfigError::InvalidCheck { operation, reason, .. }
                    if operation == "create-rg" && reason.contains("'resource' is malformed")),
                "{check}: {err}"
            );
        }
    }

    #[test]
    fn test_exit_code_check_requires_integer_expected() {
        for check in ["{type: exit_code_equals}", "{type: exit_code_equals, expected: zero}"] {
            let err = convert_with_check(check).unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidCheck { ref kind, .. } if kind == "exit_code_equals"
            ));
        }

        let def = convert_with_check("{type: exit_code_equals, expected: 3}").unwrap();
        assert!(
            def.validation
                .iter()
                .any(|c| *c == ValidationCheck::ExitCodeEquals { expected: 3 })
        );
    }

    #[test]
    fn test_property_check_requires_path() {
        for check in [
            "{type: property_equals, expected: 10.0.0.0/16}",
            "{type: property_equals, path: '', expected: 10.0.0.0/16}",
        ] {
            let err = convert_with_check(check).unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidCheck { ref reason, .. } if reason.contains("'path'")
            ));
        }
    }

    #[test]
    fn test_malformed_checks_are_reported_by_schema() {
        let dir = TempDir::new().unwrap();
        let content = RG.replace(
            "      - type: exit_code_equals
        expected: 0
",
            "      - type: exit_code_equals
      - type: property_equals
        expected: x
",
        );
        let path = write_op(dir.path(), "management", "rg.yaml", &content);
        let errors = check_file(&path, &caps()).errors.join("\n");
        assert!(errors.contains("checks[0] (exit_code_equals): 'expected' is required"));
        assert!(errors.contains("checks[1] (property_equals): 'path' must be a non-empty string"));
    }

    #[test]
    fn test_yaml_parse_error_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = write_op(dir.path(), "storage", "broken.yaml", "operation: [unclosed");
        let report = check_file(&path, &caps());
        assert!(report.errors[0].starts_with("YAML parsing error"));
    }

    #[test]
    fn test_dependency_report() {
        let dir = TempDir::new().unwrap();
        let op = |id: &str, requires: &str| {
            RG.replace("id: create-rg", &format!("id: {id}"))
                .replace("  target:", &format!("  requires: [{requires}]\n  target:"))
        };
        write_op(dir.path(), "management", "a.yaml", &op("a", "b"));
        write_op(dir.path(), "management", "b.yaml", &op("b", "a"));
        write_op(dir.path(), "management", "c.yaml", &op("c", "a, ghost"));

        let report = Catalog::load(dir.path(), &caps()).unwrap().dependency_report();
        assert_eq!(report.loaded, 3);
        assert_eq!(
            report.missing,
            vec![MissingDependency {
                operation: "c".to_string(),
                missing: "ghost".to_string(),
                file: dir.path().join("management/operations/c.yaml"),
            }]
        );
        assert_eq!(report.cycles, vec![vec!["a".to_string(), "b".to_string()]]);
        assert!(report.has_errors());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Catalog::load(&dir.path().join("nowhere"), &caps()).is_err());
    }

    #[test]
    fn test_empty_catalog_cannot_plan() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::load(dir.path(), &caps()).unwrap();
        assert!(matches!(
            catalog.definitions(&renderer(), DefinitionDefaults::default()),
            Err(CatalogError::Empty(_))
        ));
    }
}
