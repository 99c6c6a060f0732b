//! End-to-end tests driving the compiled `phaser` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const AUDIT_DOC: &str = "# Demo Audit\n\nSetup prose.\n\n## Phase 1: First Step\n\n### Goal\n\nDo the first thing.\n\n### Files\n\n- Create `a.txt` - seed file\n\n### Verification\n\n- `true`\n\n## Phase 2: Second Step\n\n### Goal\n\nDo the second thing.\n\n### Files\n\n- Create `b.txt` - another file\n";

fn phaser(project: &Path) -> Command {
    let mut cmd = Command::cargo_bin("phaser").unwrap();
    cmd.current_dir(project)
        .env("PHASER_STORAGE_DIR", project.join(".phaser"))
        // Keep the user scope inside the sandbox too
        .env("HOME", project)
        .env("NO_COLOR", "1");
    cmd
}

fn write_contract(project: &Path) {
    let contracts_dir = project.join(".claude/contracts");
    std::fs::create_dir_all(&contracts_dir).unwrap();
    std::fs::write(
        contracts_dir.join("no-force-unwrap.yaml"),
        r#"version: 1
rule:
  id: no-force-unwrap
  type: forbid_pattern
  severity: error
  pattern: '\w+!\s*(?://|$)'
  file_glob: "**/*.swift"
  message: "Avoid force unwrapping optionals. Use guard let or if let instead."
created_at: "2025-01-01T00:00:00.000Z"
enabled: true
"#,
    )
    .unwrap();
}

// =========================================
// validate
// =========================================

#[test]
fn validate_good_document_exits_zero() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("audit.md"), AUDIT_DOC).unwrap();
    phaser(dir.path())
        .args(["validate", "audit.md"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 phase(s)"));
}

#[test]
fn validate_strict_fails_on_warnings() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("audit.md"),
        "## Phase 1: Bare\n\n### Goal\n\ng\n",
    )
    .unwrap();
    phaser(dir.path())
        .args(["validate", "audit.md", "--strict"])
        .assert()
        .code(1);
    phaser(dir.path())
        .args(["validate", "audit.md"])
        .assert()
        .success();
}

#[test]
fn validate_json_output_is_machine_readable() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("audit.md"), AUDIT_DOC).unwrap();
    let output = phaser(dir.path())
        .args(["validate", "audit.md", "--json"])
        .output()
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["phase_count"], 2);
    assert_eq!(parsed["valid"], true);
}

#[test]
fn usage_error_exits_two() {
    let dir = TempDir::new().unwrap();
    phaser(dir.path())
        .args(["validate"])
        .assert()
        .code(2);
}

// =========================================
// enforce
// =========================================

#[test]
fn enforce_pre_tool_use_deny_matches_contract() {
    let dir = TempDir::new().unwrap();
    write_contract(dir.path());
    let input = serde_json::json!({
        "tool_name": "Write",
        "tool_input": {
            "file_path": "src/app.swift",
            "content": "import Foundation\nlet value = optional!\n"
        },
        "cwd": dir.path().to_string_lossy(),
        "hook_event_name": "PreToolUse",
    });
    phaser(dir.path())
        .args(["enforce", "--stdin", "--severity", "error"])
        .write_stdin(input.to_string())
        .assert()
        .success()
        .stdout(predicate::eq(
            "{\"hookSpecificOutput\":{\"hookEventName\":\"PreToolUse\",\
             \"permissionDecision\":\"deny\",\
             \"permissionDecisionReason\":\"Contract violation: no-force-unwrap at line 2. \
             Avoid force unwrapping optionals. Use guard let or if let instead.\"}}",
        ));
}

#[test]
fn enforce_ignore_directive_allows() {
    let dir = TempDir::new().unwrap();
    write_contract(dir.path());
    let input = serde_json::json!({
        "tool_name": "Write",
        "tool_input": {
            "file_path": "src/app.swift",
            "content": "let value = optional! // phaser:ignore no-force-unwrap\n"
        },
        "cwd": dir.path().to_string_lossy(),
        "hook_event_name": "PreToolUse",
    });
    phaser(dir.path())
        .args(["enforce", "--stdin", "--severity", "error"])
        .write_stdin(input.to_string())
        .assert()
        .success()
        .stdout(predicate::eq(
            "{\"hookSpecificOutput\":{\"hookEventName\":\"PreToolUse\",\"permissionDecision\":\"allow\"}}",
        ));
}

#[test]
fn enforce_malformed_stdin_exits_three() {
    let dir = TempDir::new().unwrap();
    phaser(dir.path())
        .args(["enforce", "--stdin"])
        .write_stdin("this is not json")
        .assert()
        .code(3);
}

#[test]
fn enforce_path_traversal_exits_three() {
    let dir = TempDir::new().unwrap();
    let input = serde_json::json!({
        "tool_name": "Write",
        "tool_input": {"file_path": "../escape.txt", "content": "x"},
        "cwd": dir.path().to_string_lossy(),
    });
    phaser(dir.path())
        .args(["enforce", "--stdin"])
        .write_stdin(input.to_string())
        .assert()
        .code(3);
}

#[test]
fn enforce_post_tool_use_clean_is_empty_object() {
    let dir = TempDir::new().unwrap();
    write_contract(dir.path());
    let input = serde_json::json!({
        "tool_name": "Write",
        "tool_input": {"file_path": "src/ok.swift", "content": "let x = y ?? z\n"},
        "cwd": dir.path().to_string_lossy(),
        "hook_event_name": "PostToolUse",
    });
    phaser(dir.path())
        .args(["enforce", "--stdin"])
        .write_stdin(input.to_string())
        .assert()
        .success()
        .stdout(predicate::eq("{}"));
}

// =========================================
// prepare / execute
// =========================================

#[test]
fn prepare_splits_phase_files() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("audit.md"), AUDIT_DOC).unwrap();
    phaser(dir.path())
        .args(["prepare", "audit.md"])
        .assert()
        .success();
    let phases = dir.path().join(".phaser/phases");
    assert!(phases.join("setup.md").exists());
    assert!(phases.join("phase-01-first-step.md").exists());
    assert!(phases.join("phase-02-second-step.md").exists());

    // Second prepare without --force refuses
    phaser(dir.path())
        .args(["prepare", "audit.md"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--force"));
}

#[test]
fn execute_completes_and_records_audit() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("audit.md"), AUDIT_DOC).unwrap();
    phaser(dir.path())
        .args(["execute", "audit.md"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 completed"));

    phaser(dir.path())
        .args(["audits", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("demo-audit"));

    phaser(dir.path())
        .args(["events", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("audit_completed"));
}

// =========================================
// contracts / check
// =========================================

#[test]
fn check_gates_on_error_violations() {
    let dir = TempDir::new().unwrap();
    write_contract(dir.path());
    std::fs::write(dir.path().join("app.swift"), "let v = o!\n").unwrap();
    phaser(dir.path()).args(["check"]).assert().code(1);

    std::fs::write(dir.path().join("app.swift"), "let v = o ?? p\n").unwrap();
    phaser(dir.path())
        .args(["check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("all contracts passed"));
}

#[test]
fn contracts_create_and_list() {
    let dir = TempDir::new().unwrap();
    phaser(dir.path())
        .args([
            "contracts",
            "create",
            "--id",
            "no-todo",
            "--type",
            "forbid-pattern",
            "--pattern",
            "TODO",
            "--glob",
            "**/*.rs",
            "--message",
            "No TODOs.",
        ])
        .assert()
        .success();
    phaser(dir.path())
        .args(["contracts", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no-todo"));
    phaser(dir.path())
        .args(["contracts", "show", "no-todo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("forbid_pattern"));
}

// =========================================
// config
// =========================================

#[test]
fn config_set_and_show_roundtrip() {
    let dir = TempDir::new().unwrap();
    phaser(dir.path())
        .args(["config", "set", "engine.retries", "7"])
        .assert()
        .success();
    phaser(dir.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("retries: 7"));
    phaser(dir.path())
        .args(["config", "reset"])
        .assert()
        .success();
    phaser(dir.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("retries: 3"));
}

// =========================================
// negotiate
// =========================================

#[test]
fn negotiate_skip_and_export() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("audit.md"), AUDIT_DOC).unwrap();
    phaser(dir.path())
        .args(["--yes", "negotiate", "skip", "audit.md", "phase-2"])
        .assert()
        .success();
    let output = phaser(dir.path())
        .args(["--yes", "negotiate", "export", "audit.md"])
        .output()
        .unwrap();
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("## Phase 1: First Step"));
    assert!(!stdout.contains("Second Step"));
}

// =========================================
// analytics
// =========================================

#[test]
fn analytics_import_and_show() {
    let dir = TempDir::new().unwrap();
    let report = "# Execution Report\n\n## Metadata\n\n| Key | Value |\n|---|---|\n| Audit Document | audit.md |\n| Title | Demo |\n| Project | demo |\n| Project Path | /tmp/demo |\n| Branch | main |\n| Started | 2025-03-01T10:00:00.000Z |\n| Completed | 2025-03-01T10:10:00.000Z |\n| Phaser Version | 0.1.0 |\n| Status | success |\n| Base Commit | aaa |\n| Final Commit | bbb |\n| Commits | 2 |\n| Files Changed | 3 |\n\n## Execution Summary\n\n| # | Phase | Status | Commit |\n|---|---|---|---|\n| 1 | One | ✅ | aaa1 |\n\n## Test Results\n\n**Baseline:** 10\n**Final:** 12\n**Delta:** +2\n";
    std::fs::write(dir.path().join("report.md"), report).unwrap();
    phaser(dir.path())
        .args(["analytics", "import", "report.md"])
        .assert()
        .success();
    phaser(dir.path())
        .args(["analytics", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Demo"))
        .stdout(predicate::str::contains("100% success"));
}
