//! Declarative contract rules.
//!
//! A contract is a rule evaluated against file content or existence:
//! forbid/require a pattern, require/forbid a literal substring, or
//! require a file to exist or not exist. Rules are data — they never
//! carry code — and live as one YAML file per contract in the user or
//! project scope.

pub mod ignore;
pub mod store;

pub use ignore::IgnoreDirectives;
pub use store::ContractStore;

use serde::{Deserialize, Serialize};

/// The closed set of rule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    ForbidPattern,
    RequirePattern,
    FileExists,
    FileNotExists,
    FileContains,
    FileNotContains,
}

impl RuleType {
    /// Whether this kind requires a `pattern`.
    pub fn needs_pattern(&self) -> bool {
        matches!(
            self,
            RuleType::ForbidPattern
                | RuleType::RequirePattern
                | RuleType::FileContains
                | RuleType::FileNotContains
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::ForbidPattern => "forbid_pattern",
            RuleType::RequirePattern => "require_pattern",
            RuleType::FileExists => "file_exists",
            RuleType::FileNotExists => "file_not_exists",
            RuleType::FileContains => "file_contains",
            RuleType::FileNotContains => "file_not_contains",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// The rule payload of a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub file_glob: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Where a contract came from, when it was derived from an audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSource {
    pub id: String,
    pub slug: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<u32>,
}

/// One persisted contract (`contracts/<id>.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_source: Option<AuditSource>,
    pub rule: Rule,
    pub created_at: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Contract {
    pub fn new(rule: Rule) -> Self {
        Self {
            version: 1,
            audit_source: None,
            rule,
            created_at: crate::util::now_iso(),
            enabled: true,
        }
    }
}

/// One rule violation found in one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
    pub matched_text: String,
    pub message: String,
    pub severity: Severity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_type_needs_pattern() {
        assert!(RuleType::ForbidPattern.needs_pattern());
        assert!(RuleType::RequirePattern.needs_pattern());
        assert!(RuleType::FileContains.needs_pattern());
        assert!(RuleType::FileNotContains.needs_pattern());
        assert!(!RuleType::FileExists.needs_pattern());
        assert!(!RuleType::FileNotExists.needs_pattern());
    }

    #[test]
    fn test_contract_yaml_roundtrip() {
        let contract = Contract::new(Rule {
            id: "no-force-unwrap".to_string(),
            rule_type: RuleType::ForbidPattern,
            severity: Severity::Error,
            pattern: Some(r"\w+!\s*(?://|$)".to_string()),
            file_glob: "**/*.swift".to_string(),
            message: "Avoid force unwrapping optionals.".to_string(),
            rationale: Some("Crashes at runtime.".to_string()),
        });
        let yaml = serde_yaml::to_string(&contract).unwrap();
        let parsed: Contract = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, contract);
        // Pattern survives as a literal string
        assert_eq!(parsed.rule.pattern.as_deref(), Some(r"\w+!\s*(?://|$)"));
    }

    #[test]
    fn test_contract_enabled_defaults_true() {
        let yaml = r#"
version: 1
rule:
  id: x
  type: file_exists
  file_glob: "README.md"
  message: "README required"
created_at: "2025-01-01T00:00:00.000Z"
"#;
        let contract: Contract = serde_yaml::from_str(yaml).unwrap();
        assert!(contract.enabled);
        assert_eq!(contract.rule.severity, Severity::Error);
    }

    #[test]
    fn test_rule_type_serde_names() {
        assert_eq!(
            serde_yaml::to_string(&RuleType::FileNotContains).unwrap().trim(),
            "file_not_contains"
        );
        let ty: RuleType = serde_yaml::from_str("forbid_pattern").unwrap();
        assert_eq!(ty, RuleType::ForbidPattern);
    }
}
