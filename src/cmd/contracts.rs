//! `phaser contracts` management and the `phaser check` CI gate.

use super::{CmdContext, OutputFormat};
use crate::contracts::store::{
    PROJECT_CONTRACTS_DIR, find_contract_file, save_contract, user_contracts_dir,
};
use crate::contracts::{Contract, ContractStore, IgnoreDirectives, Rule, RuleType, Severity, Violation};
use crate::manifest::{self, CaptureOptions, EntryType};
use anyhow::{Context, Result, bail};
use console::style;
use std::path::PathBuf;

pub struct CreateArgs {
    pub id: String,
    pub rule_type: RuleType,
    pub pattern: Option<String>,
    pub file_glob: String,
    pub message: String,
    pub severity: Severity,
    pub rationale: Option<String>,
    /// Write to the user scope instead of the project scope.
    pub user_scope: bool,
}

fn scope_dirs(ctx: &CmdContext) -> (PathBuf, Option<PathBuf>) {
    (ctx.root.join(PROJECT_CONTRACTS_DIR), user_contracts_dir())
}

pub fn create(ctx: &CmdContext, args: CreateArgs) -> Result<PathBuf> {
    if args.rule_type.needs_pattern() && args.pattern.is_none() {
        bail!("{} requires --pattern", args.rule_type.as_str());
    }
    let contract = Contract::new(Rule {
        id: args.id,
        rule_type: args.rule_type,
        severity: args.severity,
        pattern: args.pattern,
        file_glob: args.file_glob,
        message: args.message,
        rationale: args.rationale,
    });

    let (project_dir, user_dir) = scope_dirs(ctx);
    let dir = if args.user_scope {
        user_dir.context("No home directory for user-scope contracts")?
    } else {
        project_dir
    };
    let path = save_contract(&dir, &contract)?;
    println!(
        "{} contract '{}' written to {}",
        style("ok:").green(),
        contract.rule.id,
        path.display()
    );
    Ok(path)
}

pub fn list(ctx: &CmdContext, json: bool) -> Result<()> {
    let store = ContractStore::load_default(&ctx.root);
    if json {
        return super::print_json(&store.contracts());
    }
    if store.is_empty() {
        println!("No contracts configured");
        return Ok(());
    }
    for contract in store.contracts() {
        let state = if contract.enabled {
            style("enabled").green().to_string()
        } else {
            style("disabled").yellow().to_string()
        };
        println!(
            "{:<24} {:<18} {:<8} {}  {}",
            contract.rule.id,
            contract.rule.rule_type.as_str(),
            contract.rule.severity,
            state,
            contract.rule.file_glob
        );
    }
    Ok(())
}

pub fn show(ctx: &CmdContext, rule_id: &str) -> Result<()> {
    let store = ContractStore::load_default(&ctx.root);
    let contract = store
        .get(rule_id)
        .with_context(|| format!("No contract with id '{}'", rule_id))?;
    print!("{}", serde_yaml::to_string(contract)?);
    Ok(())
}

pub fn set_enabled(ctx: &CmdContext, rule_id: &str, enabled: bool) -> Result<()> {
    let (project_dir, user_dir) = scope_dirs(ctx);
    let mut dirs: Vec<&std::path::Path> = vec![project_dir.as_path()];
    if let Some(user) = user_dir.as_deref() {
        dirs.push(user);
    }
    let path = find_contract_file(&dirs, rule_id)
        .with_context(|| format!("No contract with id '{}'", rule_id))?;
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut contract: Contract = serde_yaml::from_str(&content)
        .with_context(|| format!("Corrupt contract {}", path.display()))?;
    contract.enabled = enabled;
    std::fs::write(&path, serde_yaml::to_string(&contract)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!(
        "{} contract '{}' {}",
        style("ok:").green(),
        rule_id,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Run every enabled contract over the working tree. Used by both
/// `contracts check` and the `check` CI gate. Returns the surviving
/// violations (ignore directives already applied).
pub fn check(ctx: &CmdContext, format: OutputFormat) -> Result<Vec<Violation>> {
    let contracts = ContractStore::load_default(&ctx.root);
    let config = ctx.store.get_config()?;
    let tree = manifest::capture(&ctx.root, &CaptureOptions::from_config(&config.manifest))?;

    let mut violations = Vec::new();
    for entry in &tree.files {
        if entry.entry_type != EntryType::Text {
            continue;
        }
        let Some(content) = &entry.content else {
            continue;
        };
        let found = contracts.check_content(&entry.path, content, &ctx.root);
        let directives = IgnoreDirectives::parse(&entry.path, content);
        violations.extend(
            found
                .into_iter()
                .filter(|v| !directives.is_suppressed(v.line_number.unwrap_or(1), &v.rule_id)),
        );
    }

    match format {
        OutputFormat::Json => super::print_json(&violations)?,
        _ => {
            if violations.is_empty() {
                println!("{} all contracts passed", style("ok:").green());
            }
            for violation in &violations {
                let badge = match violation.severity {
                    Severity::Error => style("error").red().to_string(),
                    Severity::Warning => style("warning").yellow().to_string(),
                };
                println!(
                    "{}: {} at {}:{} — {}",
                    badge,
                    violation.rule_id,
                    violation.file_path,
                    violation.line_number.unwrap_or(1),
                    violation.message
                );
            }
        }
    }
    Ok(violations)
}

/// Exit policy for the CI gate: errors always gate; `--fail-on-error`
/// makes warnings gate too.
pub fn gate_failed(violations: &[Violation], fail_on_error: bool) -> bool {
    if fail_on_error {
        !violations.is_empty()
    } else {
        violations.iter().any(|v| v.severity == Severity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use tempfile::tempdir;

    fn ctx() -> (CmdContext, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::at(dir.path().join(".phaser")).unwrap();
        (
            CmdContext {
                root: dir.path().to_path_buf(),
                store,
            },
            dir,
        )
    }

    fn create_args(id: &str) -> CreateArgs {
        CreateArgs {
            id: id.to_string(),
            rule_type: RuleType::ForbidPattern,
            pattern: Some("FIXME".to_string()),
            file_glob: "**/*.rs".to_string(),
            message: "No FIXME markers.".to_string(),
            severity: Severity::Error,
            rationale: None,
            user_scope: false,
        }
    }

    #[test]
    fn test_create_requires_pattern_for_pattern_rules() {
        let (ctx, _dir) = ctx();
        let mut args = create_args("x");
        args.pattern = None;
        assert!(create(&ctx, args).is_err());
    }

    #[test]
    fn test_create_then_check_finds_violation() {
        let (ctx, dir) = ctx();
        create(&ctx, create_args("no-fixme")).unwrap();
        std::fs::write(dir.path().join("main.rs"), "// FIXME later\n").unwrap();

        let violations = check(&ctx, OutputFormat::Summary).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule_id, "no-fixme");
        assert!(gate_failed(&violations, false));
    }

    #[test]
    fn test_check_respects_ignore_directives() {
        let (ctx, dir) = ctx();
        create(&ctx, create_args("no-fixme")).unwrap();
        std::fs::write(
            dir.path().join("main.rs"),
            "// FIXME later // phaser:ignore no-fixme\n",
        )
        .unwrap();
        let violations = check(&ctx, OutputFormat::Summary).unwrap();
        assert!(violations.is_empty());
    }

    #[test]
    fn test_disable_silences_rule() {
        let (ctx, dir) = ctx();
        create(&ctx, create_args("no-fixme")).unwrap();
        std::fs::write(dir.path().join("main.rs"), "// FIXME later\n").unwrap();
        set_enabled(&ctx, "no-fixme", false).unwrap();
        let violations = check(&ctx, OutputFormat::Summary).unwrap();
        assert!(violations.is_empty());
        set_enabled(&ctx, "no-fixme", true).unwrap();
        assert_eq!(check(&ctx, OutputFormat::Summary).unwrap().len(), 1);
    }

    #[test]
    fn test_gate_policy() {
        let warning = Violation {
            rule_id: "w".to_string(),
            file_path: "a.rs".to_string(),
            line_number: Some(1),
            matched_text: String::new(),
            message: "m".to_string(),
            severity: Severity::Warning,
        };
        assert!(!gate_failed(&[warning.clone()], false));
        assert!(gate_failed(&[warning], true));
        assert!(!gate_failed(&[], true));
    }
}
