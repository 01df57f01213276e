//! `{{NAME}}` placeholder substitution.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use workflow::ConfigError;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.-]*)\s*\}\}")
        .unwrap_or_else(|_| panic!("static placeholder regex failed to compile"))
});

/// Substitutes parameter values into template text.
#[derive(Debug, Clone, Default)]
pub struct Renderer {
    values: BTreeMap<String, String>,
}

impl Renderer {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    /// Layer defaults under the configured values.
    pub fn with_defaults<'a, I>(&self, defaults: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut values = self.values.clone();
        for (name, value) in defaults {
            values
                .entry(name.to_string())
                .or_insert_with(|| value.to_string());
        }
        Self { values }
    }

    /// Render `text` for `operation`. Any placeholder without a value is an error.
    pub fn render(&self, operation: &str, text: &str) -> Result<String, ConfigError> {
        if let Some(missing) = placeholders(text)
            .into_iter()
            .find(|name| !self.values.contains_key(name))
        {
            return Err(ConfigError::UnresolvedPlaceholder {
                operation: operation.to_string(),
                placeholder: missing,
            });
        }

        Ok(PLACEHOLDER
            .replace_all(text, |caps: &Captures<'_>| self.values[&caps[1]].clone())
            .into_owned())
    }
}

/// Placeholder names used in `text`, in order of first appearance.
pub fn placeholders(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in PLACEHOLDER.captures_iter(text) {
        let name = caps[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}
