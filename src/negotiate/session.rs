//! Negotiation session persistence and Markdown export.

use super::NegotiationState;
use crate::audit::Phase;
use crate::store::Store;
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Hash identifying a source document; the session file name.
pub fn source_hash(source_content: &str) -> String {
    crate::util::sha256_hex(source_content.as_bytes())[..16].to_string()
}

fn session_path(store: &Store, hash: &str) -> PathBuf {
    store.negotiate_dir().join(format!("{}.yaml", hash))
}

/// Persist the session under `negotiate/<source-hash>.yaml`.
pub fn save_session(store: &Store, state: &NegotiationState) -> Result<PathBuf> {
    let path = session_path(store, &state.source_hash);
    let yaml = serde_yaml::to_string(state).context("Failed to serialize negotiation session")?;
    crate::store::lock::write_locked(&path, &yaml)?;
    Ok(path)
}

/// Load a prior session for the same source content, if one exists.
pub fn load_session(store: &Store, source_content: &str) -> Result<Option<NegotiationState>> {
    let path = session_path(store, &source_hash(source_content));
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let state = serde_yaml::from_str(&content)
        .with_context(|| format!("Corrupt negotiation session {}", path.display()))?;
    Ok(Some(state))
}

/// Remove a persisted session.
pub fn delete_session(store: &Store, source_content: &str) -> Result<bool> {
    let path = session_path(store, &source_hash(source_content));
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        return Ok(true);
    }
    Ok(false)
}

/// Export the negotiated phases as a Markdown audit document.
///
/// The header comment lists the operations applied. Output phases are
/// renumbered sequentially; skipped phases are omitted, or rendered as
/// comment blocks when `include_skipped` is set.
pub fn export_markdown(state: &NegotiationState, include_skipped: bool) -> String {
    let mut out = String::new();

    out.push_str("<!--\n");
    out.push_str(&format!(
        "  Negotiated from {} ({} operation(s) applied):\n",
        state.source_file,
        state.operations.len()
    ));
    for op in &state.operations {
        out.push_str(&format!("  - {}\n", op.description));
    }
    out.push_str("-->\n\n");

    let mut number = 0u32;
    for phase in &state.current_phases {
        let skipped = state.skipped_ids.contains(&phase.id);
        if skipped && !include_skipped {
            continue;
        }
        if skipped {
            out.push_str("<!-- skipped phase\n");
            out.push_str(&render_phase(phase, phase.number));
            out.push_str("-->\n\n");
            continue;
        }
        number += 1;
        out.push_str(&render_phase(phase, number));
        out.push('\n');
    }
    out
}

/// Render one phase as a Markdown section.
pub fn render_phase(phase: &Phase, number: u32) -> String {
    let mut out = String::new();
    out.push_str(&format!("## Phase {}: {}\n\n", number, phase.title));

    if !phase.context.is_empty() {
        out.push_str("### Context\n\n");
        out.push_str(&phase.context);
        out.push_str("\n\n");
    }
    if !phase.goal.is_empty() {
        out.push_str("### Goal\n\n");
        out.push_str(&phase.goal);
        out.push_str("\n\n");
    }
    if !phase.files.is_empty() {
        out.push_str("### Files\n\n");
        for file in &phase.files {
            let action = match file.action {
                crate::audit::FileAction::Create => "Create",
                crate::audit::FileAction::Modify => "Modify",
                crate::audit::FileAction::Delete => "Delete",
                crate::audit::FileAction::Rename => "Rename",
            };
            match (&file.old_path, file.action) {
                (Some(old), crate::audit::FileAction::Rename) => {
                    out.push_str(&format!("- {} `{}` to `{}`", action, old, file.path));
                }
                _ => {
                    out.push_str(&format!("- {} `{}`", action, file.path));
                }
            }
            if !file.description.is_empty() {
                out.push_str(&format!(" - {}", file.description));
            }
            out.push('\n');
        }
        out.push('\n');
    }
    for (heading, items) in [
        ("Plan", &phase.plan),
        ("Verification", &phase.verification),
        ("Acceptance Criteria", &phase.acceptance_criteria),
        ("Rollback", &phase.rollback),
    ] {
        if items.is_empty() {
            continue;
        }
        out.push_str(&format!("### {}\n\n", heading));
        for item in items {
            out.push_str(&format!("- {}\n", item));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditParser, FileAction, FileChangeIntent};
    use crate::negotiate::NegotiationEngine;
    use tempfile::tempdir;

    fn engine() -> NegotiationEngine {
        let mut one = Phase::new(1, "First");
        one.goal = "Do the first thing.".to_string();
        one.files.push(FileChangeIntent {
            path: "src/a.rs".to_string(),
            action: FileAction::Modify,
            description: "tighten".to_string(),
            old_path: None,
        });
        one.verification.push("`cargo test`".to_string());
        let mut two = Phase::new(2, "Second");
        two.files.push(FileChangeIntent {
            path: "src/b.rs".to_string(),
            action: FileAction::Create,
            description: String::new(),
            old_path: None,
        });
        NegotiationEngine::new("plan.md", "# source doc", vec![one, two])
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = Store::at(dir.path().join(".phaser")).unwrap();
        let mut negotiation = engine();
        negotiation.skip("phase-2").unwrap();

        save_session(&store, &negotiation.state).unwrap();
        let loaded = load_session(&store, "# source doc").unwrap().unwrap();
        assert_eq!(loaded, negotiation.state);
    }

    #[test]
    fn test_load_different_source_is_none() {
        let dir = tempdir().unwrap();
        let store = Store::at(dir.path().join(".phaser")).unwrap();
        let negotiation = engine();
        save_session(&store, &negotiation.state).unwrap();
        assert!(load_session(&store, "# other doc").unwrap().is_none());
    }

    #[test]
    fn test_delete_session() {
        let dir = tempdir().unwrap();
        let store = Store::at(dir.path().join(".phaser")).unwrap();
        let negotiation = engine();
        save_session(&store, &negotiation.state).unwrap();
        assert!(delete_session(&store, "# source doc").unwrap());
        assert!(!delete_session(&store, "# source doc").unwrap());
    }

    #[test]
    fn test_export_lists_operations_in_header() {
        let mut negotiation = engine();
        negotiation.skip("phase-2").unwrap();
        let output = export_markdown(&negotiation.state, false);
        assert!(output.starts_with("<!--"));
        assert!(output.contains("1 operation(s) applied"));
        assert!(output.contains("skipped phase-2"));
    }

    #[test]
    fn test_export_omits_skipped_and_renumbers() {
        let mut negotiation = engine();
        negotiation.skip("phase-1").unwrap();
        let output = export_markdown(&negotiation.state, false);
        assert!(!output.contains("First"));
        // The surviving phase is renumbered to 1 in the output
        assert!(output.contains("## Phase 1: Second"));
    }

    #[test]
    fn test_export_include_skipped_renders_comment_block() {
        let mut negotiation = engine();
        negotiation.skip("phase-1").unwrap();
        let output = export_markdown(&negotiation.state, true);
        assert!(output.contains("<!-- skipped phase"));
        assert!(output.contains("First"));
    }

    #[test]
    fn test_export_reparses_cleanly() {
        let negotiation = engine();
        let output = export_markdown(&negotiation.state, false);
        let parsed = AuditParser::parse(&output);
        assert_eq!(parsed.phases.len(), 2);
        assert_eq!(parsed.phases[0].title, "First");
        assert_eq!(parsed.phases[0].goal, "Do the first thing.");
        assert_eq!(parsed.phases[0].files.len(), 1);
        assert_eq!(parsed.phases[1].files[0].action, FileAction::Create);
    }

    #[test]
    fn test_render_phase_rename_form() {
        let mut phase = Phase::new(1, "Rename");
        phase.files.push(FileChangeIntent {
            path: "src/new.rs".to_string(),
            action: FileAction::Rename,
            description: String::new(),
            old_path: Some("src/old.rs".to_string()),
        });
        let out = render_phase(&phase, 1);
        assert!(out.contains("- Rename `src/old.rs` to `src/new.rs`"));
    }
}
