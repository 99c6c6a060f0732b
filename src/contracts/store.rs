//! Contract loading, validation, and evaluation.
//!
//! Contracts are loaded from two scopes — project (`.claude/contracts/`)
//! and user (`~/.phaser/contracts/`) — with the project winning when both
//! define the same rule id. Invalid rules are skipped with a stderr
//! warning; they never abort a load.

use super::{Contract, RuleType, Violation};
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Project-scope contracts directory, relative to the project root.
pub const PROJECT_CONTRACTS_DIR: &str = ".claude/contracts";

/// Per-rule evaluation budget. A rule that blows it is skipped for the
/// rest of the run with a stderr warning.
const PATTERN_BUDGET: Duration = Duration::from_millis(100);

static RULE_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]{1,64}$").unwrap());

/// User-scope contracts directory (`~/.phaser/contracts`).
pub fn user_contracts_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".phaser").join("contracts"))
}

/// Loaded, validated contracts with compiled patterns.
pub struct ContractStore {
    contracts: Vec<Contract>,
    compiled: HashMap<String, Regex>,
    timed_out: Mutex<HashSet<String>>,
}

impl ContractStore {
    /// Load from explicit scope directories; project entries shadow user
    /// entries with the same rule id.
    pub fn load(project_dir: Option<&Path>, user_dir: Option<&Path>) -> Self {
        let mut by_id: HashMap<String, Contract> = HashMap::new();
        // User scope first so project inserts overwrite on conflict.
        for dir in [user_dir, project_dir].into_iter().flatten() {
            for contract in read_contract_files(dir) {
                by_id.insert(contract.rule.id.clone(), contract);
            }
        }

        let mut contracts: Vec<Contract> = by_id.into_values().collect();
        contracts.sort_by(|a, b| a.rule.id.cmp(&b.rule.id));

        let mut compiled = HashMap::new();
        contracts.retain(|contract| match validate(contract) {
            Ok(pattern) => {
                if let Some(regex) = pattern {
                    compiled.insert(contract.rule.id.clone(), regex);
                }
                true
            }
            Err(reason) => {
                eprintln!(
                    "warning: skipping invalid contract '{}': {}",
                    contract.rule.id, reason
                );
                false
            }
        });

        Self {
            contracts,
            compiled,
            timed_out: Mutex::new(HashSet::new()),
        }
    }

    /// Load the default scopes for a project root.
    pub fn load_default(project_root: &Path) -> Self {
        let project = project_root.join(PROJECT_CONTRACTS_DIR);
        let user = user_contracts_dir();
        Self::load(Some(project.as_path()), user.as_deref())
    }

    pub fn contracts(&self) -> &[Contract] {
        &self.contracts
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    pub fn get(&self, rule_id: &str) -> Option<&Contract> {
        self.contracts.iter().find(|c| c.rule.id == rule_id)
    }

    /// Enabled contracts whose glob matches the path.
    pub fn rules_for_path(&self, path: &str) -> Vec<&Contract> {
        self.contracts
            .iter()
            .filter(|c| c.enabled && glob_matches(&c.rule.file_glob, path))
            .collect()
    }

    /// Evaluate every applicable rule against proposed content.
    ///
    /// `fs_root` anchors the existence checks of `file_exists` /
    /// `file_not_exists`, which read the filesystem rather than the
    /// proposed content.
    pub fn check_content(&self, path: &str, content: &str, fs_root: &Path) -> Vec<Violation> {
        let mut violations = Vec::new();
        for contract in self.rules_for_path(path) {
            let rule_id = &contract.rule.id;
            if self.timed_out.lock().unwrap().contains(rule_id) {
                continue;
            }
            let started = Instant::now();
            let found = evaluate_rule(contract, path, content, fs_root, &self.compiled);
            if started.elapsed() > PATTERN_BUDGET {
                eprintln!(
                    "warning: rule '{}' exceeded the {}ms evaluation budget; skipping it",
                    rule_id,
                    PATTERN_BUDGET.as_millis()
                );
                self.timed_out.lock().unwrap().insert(rule_id.clone());
                continue;
            }
            violations.extend(found);
        }
        violations
    }
}

fn read_contract_files(dir: &Path) -> Vec<Contract> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut contracts = Vec::new();
    for path in paths {
        match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|content| {
                serde_yaml::from_str::<Contract>(&content).map_err(anyhow::Error::from)
            }) {
            Ok(contract) => contracts.push(contract),
            Err(e) => {
                eprintln!("warning: skipping unreadable contract {}: {}", path.display(), e);
            }
        }
    }
    contracts
}

/// Validate one contract; returns the compiled pattern for pattern rules.
fn validate(contract: &Contract) -> Result<Option<Regex>, String> {
    let rule = &contract.rule;
    if !RULE_ID_RE.is_match(&rule.id) {
        return Err(format!(
            "rule id '{}' must match [A-Za-z0-9-]{{1,64}}",
            rule.id
        ));
    }
    if rule.message.trim().is_empty() {
        return Err("message must be non-empty".to_string());
    }
    if glob::Pattern::new(&rule.file_glob).is_err() {
        return Err(format!("invalid file glob '{}'", rule.file_glob));
    }

    if !rule.rule_type.needs_pattern() {
        return Ok(None);
    }
    let Some(pattern) = &rule.pattern else {
        return Err(format!("{} requires a pattern", rule.rule_type.as_str()));
    };
    match rule.rule_type {
        RuleType::ForbidPattern | RuleType::RequirePattern => Regex::new(pattern)
            .map(Some)
            .map_err(|e| format!("pattern does not compile: {}", e)),
        // Literal-substring rules carry a pattern but never a regex.
        _ => Ok(None),
    }
}

fn glob_matches(file_glob: &str, path: &str) -> bool {
    glob::Pattern::new(file_glob)
        .map(|p| p.matches(path))
        .unwrap_or(false)
}

fn line_of_offset(content: &str, offset: usize) -> usize {
    content[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}

fn violation(contract: &Contract, path: &str, line: Option<usize>, matched: &str) -> Violation {
    Violation {
        rule_id: contract.rule.id.clone(),
        file_path: path.to_string(),
        line_number: line,
        matched_text: matched.to_string(),
        message: contract.rule.message.clone(),
        severity: contract.rule.severity,
    }
}

fn evaluate_rule(
    contract: &Contract,
    path: &str,
    content: &str,
    fs_root: &Path,
    compiled: &HashMap<String, Regex>,
) -> Vec<Violation> {
    let rule = &contract.rule;
    match rule.rule_type {
        RuleType::ForbidPattern => {
            let Some(regex) = compiled.get(&rule.id) else {
                return Vec::new();
            };
            regex
                .find_iter(content)
                .map(|m| {
                    violation(
                        contract,
                        path,
                        Some(line_of_offset(content, m.start())),
                        m.as_str(),
                    )
                })
                .collect()
        }
        RuleType::RequirePattern => {
            let Some(regex) = compiled.get(&rule.id) else {
                return Vec::new();
            };
            if regex.is_match(content) {
                Vec::new()
            } else {
                vec![violation(contract, path, Some(1), "")]
            }
        }
        RuleType::FileContains => {
            let needle = rule.pattern.as_deref().unwrap_or_default();
            if content.contains(needle) {
                Vec::new()
            } else {
                vec![violation(contract, path, Some(1), "")]
            }
        }
        RuleType::FileNotContains => {
            let needle = rule.pattern.as_deref().unwrap_or_default();
            if needle.is_empty() {
                return Vec::new();
            }
            content
                .match_indices(needle)
                .map(|(offset, matched)| {
                    violation(contract, path, Some(line_of_offset(content, offset)), matched)
                })
                .collect()
        }
        RuleType::FileExists => {
            if fs_root.join(path).exists() {
                Vec::new()
            } else {
                vec![violation(contract, path, Some(1), "")]
            }
        }
        RuleType::FileNotExists => {
            if fs_root.join(path).exists() {
                vec![violation(contract, path, Some(1), path)]
            } else {
                Vec::new()
            }
        }
    }
}

/// Write a contract into a scope directory as `<rule-id>.yaml`.
pub fn save_contract(dir: &Path, contract: &Contract) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create contracts dir {}", dir.display()))?;
    let path = dir.join(format!("{}.yaml", contract.rule.id));
    let yaml = serde_yaml::to_string(contract).context("Failed to serialize contract")?;
    std::fs::write(&path, yaml)
        .with_context(|| format!("Failed to write contract {}", path.display()))?;
    Ok(path)
}

/// Locate the file backing a rule id across scope directories.
/// Project scope is searched first, matching load precedence.
pub fn find_contract_file(dirs: &[&Path], rule_id: &str) -> Option<PathBuf> {
    for dir in dirs {
        for name in [format!("{rule_id}.yaml"), format!("{rule_id}.yml")] {
            let candidate = dir.join(&name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        // Fall back to scanning: the file name may not match the rule id.
        for contract_path in std::fs::read_dir(dir)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
        {
            if let Ok(content) = std::fs::read_to_string(&contract_path)
                && let Ok(contract) = serde_yaml::from_str::<Contract>(&content)
                && contract.rule.id == rule_id
            {
                return Some(contract_path);
            }
        }
    }
    None
}
