//! `phaser enforce` — the hook entry point and its installer.

use crate::enforce::{MAX_STDIN_BYTES, SeverityFilter};
use crate::errors::EnforceError;
use anyhow::{Context, Result, bail};
use console::style;
use serde_json::{Value, json};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Read stdin (bounded), run the hook pipeline, and print the decision.
/// The returned string is the entire stdout payload.
pub fn run_stdin(severity: SeverityFilter) -> Result<String, EnforceError> {
    let mut raw = Vec::new();
    std::io::stdin()
        .lock()
        .take((MAX_STDIN_BYTES + 1) as u64)
        .read_to_end(&mut raw)
        .map_err(EnforceError::StdinRead)?;
    crate::enforce::run(&raw, severity)
}

/// Installation scope for the hook configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum InstallScope {
    User,
    #[default]
    Project,
    Local,
}

fn settings_path(scope: InstallScope, project_root: &Path) -> Result<PathBuf> {
    Ok(match scope {
        InstallScope::User => dirs::home_dir()
            .context("No home directory for user-scope install")?
            .join(".claude")
            .join("settings.json"),
        InstallScope::Project => project_root.join(".claude").join("settings.json"),
        InstallScope::Local => project_root.join(".claude").join("settings.local.json"),
    })
}

fn hook_entry(event: &str) -> Value {
    let severity = match event {
        "PreToolUse" => "error",
        _ => "warning",
    };
    json!({
        "matcher": "Write|Edit",
        "hooks": [{
            "type": "command",
            "command": format!("phaser enforce --stdin --severity {}", severity),
        }]
    })
}

fn is_phaser_entry(entry: &Value) -> bool {
    entry["hooks"]
        .as_array()
        .map(|hooks| {
            hooks.iter().any(|h| {
                h["command"]
                    .as_str()
                    .map(|c| c.starts_with("phaser enforce"))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Install the enforcement hook into Claude settings. Existing non-Phaser
/// configuration is preserved; an existing Phaser entry requires
/// `--force` to replace.
pub fn install(
    scope: InstallScope,
    project_root: &Path,
    dry_run: bool,
    force: bool,
) -> Result<PathBuf> {
    let path = settings_path(scope, project_root)?;
    let mut settings: Value = match std::fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("Corrupt settings file {}", path.display()))?,
        Err(_) => json!({}),
    };

    let Some(root) = settings.as_object_mut() else {
        bail!("{} is not a JSON object", path.display());
    };
    let hooks = root.entry("hooks").or_insert_with(|| json!({}));
    let Some(hooks) = hooks.as_object_mut() else {
        bail!("'hooks' in {} is not a JSON object", path.display());
    };

    for event in ["PreToolUse", "PostToolUse"] {
        let entries = hooks.entry(event).or_insert_with(|| json!([]));
        let Some(list) = entries.as_array_mut() else {
            bail!("'hooks.{}' in {} is not a list", event, path.display());
        };
        let existing = list.iter().position(is_phaser_entry);
        match existing {
            Some(idx) if force => list[idx] = hook_entry(event),
            Some(_) => bail!(
                "A phaser hook is already installed in {}; pass --force to replace it",
                path.display()
            ),
            None => list.push(hook_entry(event)),
        }
    }

    let rendered = serde_json::to_string_pretty(&settings)?;
    if dry_run {
        println!("Would write {}:", path.display());
        println!("{}", rendered);
        return Ok(path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, rendered)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!(
        "{} enforcement hook installed in {}",
        style("ok:").green(),
        path.display()
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_install_project_scope_creates_settings() {
        let dir = tempdir().unwrap();
        let path = install(InstallScope::Project, dir.path(), false, false).unwrap();
        assert!(path.ends_with(".claude/settings.json"));
        let settings: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let pre = settings["hooks"]["PreToolUse"].as_array().unwrap();
        assert_eq!(pre.len(), 1);
        assert!(
            pre[0]["hooks"][0]["command"]
                .as_str()
                .unwrap()
                .contains("--severity error")
        );
        let post = settings["hooks"]["PostToolUse"].as_array().unwrap();
        assert!(
            post[0]["hooks"][0]["command"]
                .as_str()
                .unwrap()
                .contains("--severity warning")
        );
    }

    #[test]
    fn test_install_preserves_foreign_hooks() {
        let dir = tempdir().unwrap();
        let claude_dir = dir.path().join(".claude");
        std::fs::create_dir_all(&claude_dir).unwrap();
        let existing = json!({
            "hooks": {
                "PreToolUse": [{
                    "matcher": "Bash",
                    "hooks": [{"type": "command", "command": "my-linter"}]
                }]
            },
            "model": "opus"
        });
        std::fs::write(
            claude_dir.join("settings.json"),
            serde_json::to_string(&existing).unwrap(),
        )
        .unwrap();

        let path = install(InstallScope::Project, dir.path(), false, false).unwrap();
        let settings: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(settings["model"], "opus");
        let pre = settings["hooks"]["PreToolUse"].as_array().unwrap();
        assert_eq!(pre.len(), 2);
        assert_eq!(pre[0]["hooks"][0]["command"], "my-linter");
    }

    #[test]
    fn test_install_twice_requires_force() {
        let dir = tempdir().unwrap();
        install(InstallScope::Project, dir.path(), false, false).unwrap();
        let err = install(InstallScope::Project, dir.path(), false, false).unwrap_err();
        assert!(err.to_string().contains("--force"));
        install(InstallScope::Project, dir.path(), false, true).unwrap();
        let settings: Value = serde_json::from_str(
            &std::fs::read_to_string(settings_path(InstallScope::Project, dir.path()).unwrap())
                .unwrap(),
        )
        .unwrap();
        // Still exactly one phaser entry per event
        assert_eq!(settings["hooks"]["PreToolUse"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_install_dry_run_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = install(InstallScope::Project, dir.path(), true, false).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_local_scope_path() {
        let dir = tempdir().unwrap();
        let path = install(InstallScope::Local, dir.path(), true, false).unwrap();
        assert!(path.ends_with(".claude/settings.local.json"));
    }
}
