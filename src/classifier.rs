//! Failure classification from captured action output.

use crate::config::ErrorPattern;
use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use workflow::{ActionOutput, ErrorClass, ErrorClassifier};

/// Known cloud CLI failures: (pattern, category, retryable, destructive, advice)
const BUILTIN: &[(&str, &str, bool, bool, &str)] = &[
    (
        r"TooManyRequests|\b429\b|throttl",
        "throttled",
        true,
        false,
        "The API throttled the request; retry after a pause",
    ),
    (
        r"AnotherOperationInProgress|OperationNotAllowed.*in progress|\bConflict\b",
        "conflict",
        true,
        false,
        "Another operation holds the resource; retry once it finishes",
    ),
    (
        r"AuthorizationFailed|does not have authorization|\bForbidden\b|\b403\b",
        "authorization",
        false,
        false,
        "Grant the executing identity the required role assignment",
    ),
    (
        r"Please run 'az login'|AADSTS\d+|token.*expired",
        "authentication",
        false,
        false,
        "Sign in again (az login / Connect-AzAccount)",
    ),
    (
        r"QuotaExceeded|exceed(s|ing)? .*quota|SkuNotAvailable",
        "quota",
        false,
        false,
        "Request a quota increase or choose another SKU or region",
    ),
    (
        r"NetcfgSubnetRangesOverlap|overlap|InUseSubnetCannotBeDeleted|PropertyChangeNotAllowed",
        "immutable_property",
        false,
        true,
        "The change needs the resource to be deleted and recreated",
    ),
    (
        r"already exists|AlreadyExists|is already in use",
        "already_exists",
        false,
        false,
        "Add an idempotency probe or adopt the existing resource",
    ),
    (
        r"ResourceGroupNotFound|ResourceNotFound|could not be found|\bNotFound\b",
        "not_found",
        false,
        false,
        "Check that the predecessor operations created the referenced resource",
    ),
    (
        r"InvalidTemplate|InvalidParameter|BadRequest|\bis not valid\b",
        "invalid_request",
        false,
        false,
        "Fix the rendered command or its parameters",
    ),
    (
        r"command not found|is not recognized as",
        "missing_tool",
        false,
        false,
        "Install the CLI the template needs",
    ),
    (
        r"GatewayTimeout|timed out|ServiceUnavailable|InternalServerError",
        "transient",
        true,
        false,
        "The service failed transiently; retry",
    ),
];

struct Rule {
    regex: Regex,
    class: ErrorClass,
}

fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .with_context(|| format!("Invalid error pattern: {pattern}"))
}

/// Classifier matching regex rules against failure output, first match wins.
pub struct PatternClassifier {
    rules: Vec<Rule>,
}

impl PatternClassifier {
    /// Only the built-in cloud rules.
    pub fn builtin() -> Self {
        let rules = BUILTIN
            .iter()
            .filter_map(|(pattern, category, retryable, destructive, advice)| {
                Some(Rule {
                    regex: compile(pattern).ok()?,
                    class: ErrorClass {
                        category: (*category).to_string(),
                        retryable: *retryable,
                        destructive: *destructive,
                        advice: Some((*advice).to_string()),
                    },
                })
            })
            .collect();
        Self { rules }
    }

    /// Configured rules, checked before the built-in ones.
    pub fn with_patterns(patterns: &[ErrorPattern]) -> Result<Self> {
        let mut rules = Vec::with_capacity(patterns.len() + BUILTIN.len());
        for p in patterns {
            rules.push(Rule {
                regex: compile(&p.pattern)?,
                class: ErrorClass {
                    category: p.category.clone(),
                    retryable: p.retryable,
                    destructive: p.destructive,
                    advice: p.advice.clone(),
                },
            });
        }
        rules.extend(Self::builtin().rules);
        Ok(Self { rules })
    }
}

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, output: &ActionOutput) -> Option<ErrorClass> {
        if output.timed_out {
            return Some(ErrorClass {
                category: "timeout".to_string(),
                retryable: true,
                destructive: false,
                advice: Some("Raise duration.timeout if the operation is expected to take longer".to_string()),
            });
        }

        let text = format!("{}\n{}", output.stderr, output.stdout);
        let class = self
            .rules
            .iter()
            .find(|rule| rule.regex.is_match(&text))
            .map(|rule| rule.class.clone());
        if let Some(class) = &class {
            log::debug!("Classified failure as {}", class.category);
        }
        class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn failed(stderr: &str) -> ActionOutput {
        ActionOutput::exited(1).with_stderr(stderr)
    }

    #[test]
    fn test_builtin_rules_compile() {
        assert_eq!(PatternClassifier::builtin().rules.len(), BUILTIN.len());
    }

    #[test]
    fn test_builtin_classification() {
        let c = PatternClassifier::builtin();
        let class = c
            .classify(&failed(
                "ERROR: (ResourceGroupNotFound) Resource group 'rg-prod' could not be found.",
            ))
            .unwrap();
        assert_eq!(class.category, "not_found");
        assert!(!class.retryable);

        let class = c
            .classify(&failed("(AnotherOperationInProgress) Another operation on this resource is in progress"))
            .unwrap();
        assert_eq!(class.category, "conflict");
        assert!(class.retryable);

        let class = c
            .classify(&failed("(NetcfgSubnetRangesOverlap) Subnet 'a' overlaps subnet 'b'"))
            .unwrap();
        assert!(class.destructive);
    }

    #[test]
    fn test_unmatched_output_is_unclassified() {
        assert!(PatternClassifier::builtin().classify(&failed("segfault")).is_none());
    }

    #[test]
    fn test_stdout_is_searched_too() {
        let out = ActionOutput::exited(1).with_stdout("QuotaExceeded for cores");
        let class = PatternClassifier::builtin().classify(&out).unwrap();
        assert_eq!(class.category, "quota");
    }

    #[test]
    fn test_timeout() {
        let class = PatternClassifier::builtin()
            .classify(&ActionOutput::timeout(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(class.category, "timeout");
        assert!(class.retryable);
    }

    #[test]
    fn test_configured_patterns_win() {
        let c = PatternClassifier::with_patterns(&[ErrorPattern {
            pattern: "could not be found".to_string(),
            category: "missing_dependency".to_string(),
            retryable: false,
            destructive: false,
            advice: Some("Run the networking capability first".to_string()),
        }])
        .unwrap();
        let class = c.classify(&failed("Resource group 'x' could not be found")).unwrap();
        assert_eq!(class.category, "missing_dependency");
    }

    #[test]
    fn test_invalid_configured_pattern() {
        let result = PatternClassifier::with_patterns(&[ErrorPattern {
            pattern: "([unclosed".to_string(),
            category: "x".to_string(),
            retryable: false,
            destructive: false,
            advice: None,
        }]);
        assert!(result.is_err());
    }
}
