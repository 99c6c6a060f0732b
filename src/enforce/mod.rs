//! The enforcement hook.
//!
//! A synchronous, short-lived command: one JSON object arrives on stdin
//! describing a proposed `Write` or `Edit`, the proposed file state is
//! reconstructed, contracts are checked against it, and exactly one JSON
//! object leaves on stdout with the policy decision. Policy outcomes
//! (allow, deny, warn, skip) always exit 0; only malformed input or a
//! broken invariant exits 3.
//!
//! Everything here is sized for the latency budget: contracts are loaded
//! once, patterns are compiled once and cached, no subprocesses are
//! spawned, and reconstruction is a single pass over the content.

use crate::contracts::{ContractStore, IgnoreDirectives, Severity, Violation};
use crate::errors::EnforceError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound on hook stdin.
pub const MAX_STDIN_BYTES: usize = 10 * 1024 * 1024;

/// `--severity` restriction on the checked result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SeverityFilter {
    Error,
    Warning,
    #[default]
    All,
}

impl SeverityFilter {
    fn admits(&self, severity: Severity) -> bool {
        match self {
            SeverityFilter::All => true,
            SeverityFilter::Error => severity == Severity::Error,
            SeverityFilter::Warning => severity == Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
}

#[derive(Debug, Deserialize)]
struct RawHookInput {
    tool_name: String,
    tool_input: serde_json::Value,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    hook_event_name: Option<String>,
}

/// Validated hook input.
#[derive(Debug)]
pub struct HookInput {
    pub tool_name: String,
    pub file_path: String,
    pub content: Option<String>,
    pub old_str: Option<String>,
    pub new_str: Option<String>,
    pub cwd: PathBuf,
    pub event: HookEvent,
}

/// Parse and validate raw stdin bytes.
pub fn parse_input(raw: &[u8]) -> Result<HookInput, EnforceError> {
    if raw.len() > MAX_STDIN_BYTES {
        return Err(EnforceError::StdinTooLarge {
            limit: MAX_STDIN_BYTES,
        });
    }
    let raw: RawHookInput = serde_json::from_slice(raw)
        .map_err(|e| EnforceError::MalformedInput(e.to_string()))?;

    let tool_input = raw
        .tool_input
        .as_object()
        .ok_or_else(|| EnforceError::MalformedInput("tool_input must be an object".to_string()))?;
    let file_path = tool_input
        .get("file_path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            EnforceError::MalformedInput("tool_input.file_path must be a string".to_string())
        })?
        .to_string();

    if Path::new(&file_path)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(EnforceError::PathTraversal { path: file_path });
    }

    let event = match raw.hook_event_name.as_deref() {
        None | Some("PreToolUse") => HookEvent::PreToolUse,
        Some("PostToolUse") => HookEvent::PostToolUse,
        Some(other) => {
            return Err(EnforceError::MalformedInput(format!(
                "unknown hook_event_name '{}'",
                other
            )));
        }
    };

    let get_str = |key: &str| {
        tool_input
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
    };

    Ok(HookInput {
        tool_name: raw.tool_name,
        file_path,
        content: get_str("content"),
        old_str: get_str("old_str"),
        new_str: get_str("new_str"),
        cwd: raw.cwd.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
        event,
    })
}

/// The reconstructed proposed state of the target file.
#[derive(Debug)]
pub enum Reconstruction {
    Proposed { content: String, is_new: bool },
    /// Enforcement does not apply (binary content, missing or non-UTF-8
    /// file, failed edit anchor, unknown tool).
    Skip,
}

/// Fraction of non-printable characters above which Write content is
/// treated as binary.
const BINARY_FRACTION: f64 = 0.10;

fn looks_binary(content: &str) -> bool {
    if content.contains('\0') {
        return true;
    }
    if content.is_empty() {
        return false;
    }
    let total = content.chars().count();
    let non_printable = content
        .chars()
        .filter(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        .count();
    (non_printable as f64) / (total as f64) > BINARY_FRACTION
}

/// Rebuild the proposed file content from the tool call.
pub fn reconstruct(input: &HookInput) -> Reconstruction {
    let abs_path = if Path::new(&input.file_path).is_absolute() {
        PathBuf::from(&input.file_path)
    } else {
        input.cwd.join(&input.file_path)
    };

    match input.tool_name.as_str() {
        "Write" => {
            let Some(content) = &input.content else {
                return Reconstruction::Skip;
            };
            if looks_binary(content) {
                return Reconstruction::Skip;
            }
            Reconstruction::Proposed {
                content: content.clone(),
                is_new: !abs_path.exists(),
            }
        }
        "Edit" => {
            let (Some(old_str), Some(new_str)) = (&input.old_str, &input.new_str) else {
                return Reconstruction::Skip;
            };
            let Ok(bytes) = std::fs::read(&abs_path) else {
                return Reconstruction::Skip;
            };
            let Ok(current) = String::from_utf8(bytes) else {
                return Reconstruction::Skip;
            };
            if !current.contains(old_str.as_str()) {
                return Reconstruction::Skip;
            }
            Reconstruction::Proposed {
                content: current.replacen(old_str.as_str(), new_str, 1),
                is_new: false,
            }
        }
        _ => Reconstruction::Skip,
    }
}

// Output shapes. Field order here is the wire order.

#[derive(Serialize)]
struct PreHookSpecific {
    #[serde(rename = "hookEventName")]
    hook_event_name: &'static str,
    #[serde(rename = "permissionDecision")]
    permission_decision: &'static str,
    #[serde(rename = "permissionDecisionReason", skip_serializing_if = "Option::is_none")]
    permission_decision_reason: Option<String>,
}

#[derive(Serialize)]
struct PreOutput {
    #[serde(rename = "hookSpecificOutput")]
    hook_specific_output: PreHookSpecific,
}

#[derive(Serialize)]
struct PostHookSpecific {
    #[serde(rename = "hookEventName")]
    hook_event_name: &'static str,
    #[serde(rename = "additionalContext")]
    additional_context: String,
}

#[derive(Serialize)]
struct PostOutput {
    decision: &'static str,
    reason: &'static str,
    #[serde(rename = "hookSpecificOutput")]
    hook_specific_output: PostHookSpecific,
}

fn pre_allow() -> String {
    serde_json::to_string(&PreOutput {
        hook_specific_output: PreHookSpecific {
            hook_event_name: "PreToolUse",
            permission_decision: "allow",
            permission_decision_reason: None,
        },
    })
    .expect("static output serializes")
}

fn pre_deny(violation: &Violation) -> String {
    serde_json::to_string(&PreOutput {
        hook_specific_output: PreHookSpecific {
            hook_event_name: "PreToolUse",
            permission_decision: "deny",
            permission_decision_reason: Some(format!(
                "Contract violation: {} at line {}. {}",
                violation.rule_id,
                violation.line_number.unwrap_or(1),
                violation.message
            )),
        },
    })
    .expect("static output serializes")
}

fn post_warn(violation: &Violation) -> String {
    serde_json::to_string(&PostOutput {
        decision: "block",
        reason: "Contract warning detected after file write",
        hook_specific_output: PostHookSpecific {
            hook_event_name: "PostToolUse",
            additional_context: format!(
                "Warning: {} at line {}. {}",
                violation.rule_id,
                violation.line_number.unwrap_or(1),
                violation.message
            ),
        },
    })
    .expect("static output serializes")
}

const EMPTY_OUTPUT: &str = "{}";

/// Decide on a validated input using loaded contracts. Returns the exact
/// stdout payload.
pub fn decide(input: &HookInput, contracts: &ContractStore, severity: SeverityFilter) -> String {
    let Reconstruction::Proposed { content, is_new: _ } = reconstruct(input) else {
        return EMPTY_OUTPUT.to_string();
    };

    // Contract globs and ignore styles see the project-relative path.
    let rel_path = Path::new(&input.file_path)
        .strip_prefix(&input.cwd)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| input.file_path.clone());

    let mut violations = contracts.check_content(&rel_path, &content, &input.cwd);

    let directives = IgnoreDirectives::parse(&rel_path, &content);
    violations.retain(|v| !directives.is_suppressed(v.line_number.unwrap_or(1), &v.rule_id));
    violations.retain(|v| severity.admits(v.severity));

    match input.event {
        HookEvent::PreToolUse => {
            match violations.iter().find(|v| v.severity == Severity::Error) {
                Some(violation) => pre_deny(violation),
                None => pre_allow(),
            }
        }
        HookEvent::PostToolUse => match violations.first() {
            Some(violation) => post_warn(violation),
            None => EMPTY_OUTPUT.to_string(),
        },
    }
}

/// Full hook pipeline: parse stdin, load contracts for the input's
/// working directory, decide. The caller prints the returned string as
/// the entire stdout.
pub fn run(raw: &[u8], severity: SeverityFilter) -> Result<String, EnforceError> {
    let input = parse_input(raw)?;
    let contracts = ContractStore::load_default(&input.cwd);
    Ok(decide(&input, &contracts, severity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::store::save_contract;
    use crate::contracts::{Contract, Rule, RuleType};
    use tempfile::tempdir;

    fn contract_store(dir: &Path, rules: Vec<(&str, RuleType, &str, &str, Severity, &str)>) -> ContractStore {
        for (id, ty, pattern, glob, severity, message) in rules {
            let contract = Contract::new(Rule {
                id: id.to_string(),
                rule_type: ty,
                severity,
                pattern: Some(pattern.to_string()),
                file_glob: glob.to_string(),
                message: message.to_string(),
                rationale: None,
            });
            save_contract(dir, &contract).unwrap();
        }
        ContractStore::load(Some(dir), None)
    }

    fn write_input(cwd: &Path, file_path: &str, content: &str, event: &str) -> HookInput {
        parse_input(
            serde_json::json!({
                "tool_name": "Write",
                "tool_input": {"file_path": file_path, "content": content},
                "cwd": cwd.to_string_lossy(),
                "hook_event_name": event,
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap()
    }

    const UNWRAP_MESSAGE: &str =
        "Avoid force unwrapping optionals. Use guard let or if let instead.";

    fn unwrap_store(dir: &Path) -> ContractStore {
        contract_store(
            dir,
            vec![(
                "no-force-unwrap",
                RuleType::ForbidPattern,
                r"\w+!\s*(?://|$)",
                "**/*.swift",
                Severity::Error,
                UNWRAP_MESSAGE,
            )],
        )
    }

    // =========================================
    // Input parsing
    // =========================================

    #[test]
    fn test_parse_rejects_oversized_stdin() {
        let raw = vec![b'x'; MAX_STDIN_BYTES + 1];
        assert!(matches!(
            parse_input(&raw),
            Err(EnforceError::StdinTooLarge { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(
            parse_input(b"not json"),
            Err(EnforceError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_parse_rejects_missing_file_path() {
        let raw = br#"{"tool_name":"Write","tool_input":{"content":"x"}}"#;
        assert!(matches!(
            parse_input(raw),
            Err(EnforceError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_parse_rejects_path_traversal() {
        let raw = br#"{"tool_name":"Write","tool_input":{"file_path":"../../etc/passwd","content":"x"}}"#;
        assert!(matches!(
            parse_input(raw),
            Err(EnforceError::PathTraversal { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_event() {
        let raw = br#"{"tool_name":"Write","tool_input":{"file_path":"a.rs","content":"x"},"hook_event_name":"MidToolUse"}"#;
        assert!(matches!(
            parse_input(raw),
            Err(EnforceError::MalformedInput(_))
        ));
    }

    // =========================================
    // Reconstruction
    // =========================================

    #[test]
    fn test_reconstruct_write_is_new() {
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "fresh.rs", "fn main() {}", "PreToolUse");
        match reconstruct(&input) {
            Reconstruction::Proposed { content, is_new } => {
                assert!(is_new);
                assert_eq!(content, "fn main() {}");
            }
            _ => panic!("expected Proposed"),
        }
    }

    #[test]
    fn test_reconstruct_write_binary_skips() {
        let dir = tempdir().unwrap();
        let input = write_input(dir.path(), "blob.rs", "a\u{0}b", "PreToolUse");
        assert!(matches!(reconstruct(&input), Reconstruction::Skip));
    }

    #[test]
    fn test_reconstruct_edit_applies_first_occurrence() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "old old").unwrap();
        let input = parse_input(
            serde_json::json!({
                "tool_name": "Edit",
                "tool_input": {"file_path": "a.rs", "old_str": "old", "new_str": "new"},
                "cwd": dir.path().to_string_lossy(),
                "hook_event_name": "PreToolUse",
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        match reconstruct(&input) {
            Reconstruction::Proposed { content, is_new } => {
                assert_eq!(content, "new old");
                assert!(!is_new);
            }
            _ => panic!("expected Proposed"),
        }
    }

    #[test]
    fn test_reconstruct_edit_missing_file_skips() {
        let dir = tempdir().unwrap();
        let input = parse_input(
            serde_json::json!({
                "tool_name": "Edit",
                "tool_input": {"file_path": "ghost.rs", "old_str": "a", "new_str": "b"},
                "cwd": dir.path().to_string_lossy(),
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        assert!(matches!(reconstruct(&input), Reconstruction::Skip));
    }

    #[test]
    fn test_reconstruct_edit_anchor_not_found_skips() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "content").unwrap();
        let input = parse_input(
            serde_json::json!({
                "tool_name": "Edit",
                "tool_input": {"file_path": "a.rs", "old_str": "absent", "new_str": "b"},
                "cwd": dir.path().to_string_lossy(),
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        assert!(matches!(reconstruct(&input), Reconstruction::Skip));
    }

    #[test]
    fn test_reconstruct_unknown_tool_skips() {
        let dir = tempdir().unwrap();
        let input = parse_input(
            serde_json::json!({
                "tool_name": "Bash",
                "tool_input": {"file_path": "a.rs"},
                "cwd": dir.path().to_string_lossy(),
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        assert!(matches!(reconstruct(&input), Reconstruction::Skip));
    }

    // =========================================
    // Decisions
    // =========================================

    #[test]
    fn test_pre_tool_use_deny_exact_output() {
        let contracts_dir = tempdir().unwrap();
        let store = unwrap_store(contracts_dir.path());
        let project = tempdir().unwrap();
        let input = write_input(
            project.path(),
            "src/app.swift",
            "import Foundation\nlet value = optional!\n",
            "PreToolUse",
        );
        let output = decide(&input, &store, SeverityFilter::All);
        assert_eq!(
            output,
            "{\"hookSpecificOutput\":{\"hookEventName\":\"PreToolUse\",\
             \"permissionDecision\":\"deny\",\
             \"permissionDecisionReason\":\"Contract violation: no-force-unwrap at line 2. \
             Avoid force unwrapping optionals. Use guard let or if let instead.\"}}"
        );
    }

    #[test]
    fn test_pre_tool_use_allow_exact_output() {
        let contracts_dir = tempdir().unwrap();
        let store = unwrap_store(contracts_dir.path());
        let project = tempdir().unwrap();
        let input = write_input(project.path(), "src/app.swift", "let x = y ?? z\n", "PreToolUse");
        let output = decide(&input, &store, SeverityFilter::All);
        assert_eq!(
            output,
            "{\"hookSpecificOutput\":{\"hookEventName\":\"PreToolUse\",\"permissionDecision\":\"allow\"}}"
        );
    }

    #[test]
    fn test_ignore_directive_bypasses_deny() {
        let contracts_dir = tempdir().unwrap();
        let store = unwrap_store(contracts_dir.path());
        let project = tempdir().unwrap();
        let input = write_input(
            project.path(),
            "src/app.swift",
            "let value = optional! // phaser:ignore no-force-unwrap\n",
            "PreToolUse",
        );
        let output = decide(&input, &store, SeverityFilter::All);
        assert!(output.contains("\"permissionDecision\":\"allow\""));
    }

    #[test]
    fn test_warning_does_not_deny_pre_tool_use() {
        let contracts_dir = tempdir().unwrap();
        let store = contract_store(
            contracts_dir.path(),
            vec![(
                "todo-note",
                RuleType::ForbidPattern,
                "TODO",
                "**/*.rs",
                Severity::Warning,
                "Leftover TODO.",
            )],
        );
        let project = tempdir().unwrap();
        let input = write_input(project.path(), "src/a.rs", "// TODO later\n", "PreToolUse");
        let output = decide(&input, &store, SeverityFilter::All);
        assert!(output.contains("\"permissionDecision\":\"allow\""));
    }

    #[test]
    fn test_post_tool_use_warning_output() {
        let contracts_dir = tempdir().unwrap();
        let store = contract_store(
            contracts_dir.path(),
            vec![(
                "todo-note",
                RuleType::ForbidPattern,
                "TODO",
                "**/*.rs",
                Severity::Warning,
                "Leftover TODO.",
            )],
        );
        let project = tempdir().unwrap();
        let input = write_input(project.path(), "src/a.rs", "// TODO later\n", "PostToolUse");
        let output = decide(&input, &store, SeverityFilter::All);
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["decision"], "block");
        assert_eq!(parsed["reason"], "Contract warning detected after file write");
        assert_eq!(
            parsed["hookSpecificOutput"]["hookEventName"],
            "PostToolUse"
        );
        assert_eq!(
            parsed["hookSpecificOutput"]["additionalContext"],
            "Warning: todo-note at line 1. Leftover TODO."
        );
    }

    #[test]
    fn test_post_tool_use_clean_is_empty_object() {
        let contracts_dir = tempdir().unwrap();
        let store = unwrap_store(contracts_dir.path());
        let project = tempdir().unwrap();
        let input = write_input(project.path(), "src/a.swift", "let x = 1\n", "PostToolUse");
        assert_eq!(decide(&input, &store, SeverityFilter::All), "{}");
    }

    #[test]
    fn test_binary_skip_is_empty_object() {
        let contracts_dir = tempdir().unwrap();
        let store = unwrap_store(contracts_dir.path());
        let project = tempdir().unwrap();
        let input = write_input(project.path(), "src/a.swift", "x\u{0}y!", "PreToolUse");
        assert_eq!(decide(&input, &store, SeverityFilter::All), "{}");
    }

    #[test]
    fn test_severity_filter_error_drops_warnings() {
        let contracts_dir = tempdir().unwrap();
        let store = contract_store(
            contracts_dir.path(),
            vec![(
                "todo-note",
                RuleType::ForbidPattern,
                "TODO",
                "**/*.rs",
                Severity::Warning,
                "Leftover TODO.",
            )],
        );
        let project = tempdir().unwrap();
        let input = write_input(project.path(), "src/a.rs", "// TODO later\n", "PostToolUse");
        assert_eq!(decide(&input, &store, SeverityFilter::Error), "{}");
    }

    #[test]
    fn test_absolute_file_path_relativized_for_globs() {
        let contracts_dir = tempdir().unwrap();
        let store = unwrap_store(contracts_dir.path());
        let project = tempdir().unwrap();
        let abs = project.path().join("src/app.swift");
        let input = parse_input(
            serde_json::json!({
                "tool_name": "Write",
                "tool_input": {"file_path": abs.to_string_lossy(), "content": "let v = o!\n"},
                "cwd": project.path().to_string_lossy(),
                "hook_event_name": "PreToolUse",
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        let output = decide(&input, &store, SeverityFilter::All);
        assert!(output.contains("\"permissionDecision\":\"deny\""), "{output}");
    }
}
