//! `phaser branches` — branch-mode control.

use super::CmdContext;
use crate::sandbox::{BranchMode, MergeStrategy};
use anyhow::{Result, bail};
use console::style;
use uuid::Uuid;

/// Enable branch mode for the most recent non-terminal audit (or a bare
/// context when none exists yet).
pub fn enable(ctx: &CmdContext, base: Option<&str>) -> Result<()> {
    let mode = BranchMode::new(ctx.store.clone(), ctx.root.clone());
    let mut audits = ctx.store.list_audits(None)?;
    audits.retain(|a| !a.status.is_terminal());

    let (audit_id, slug) = match audits.first() {
        Some(audit) => (audit.id, audit.slug.clone()),
        None => (Uuid::new_v4(), "unassigned".to_string()),
    };
    let config = ctx.store.get_config()?;
    let base = base.or(config.branch.base.as_deref());
    let context = mode.begin(audit_id, &slug, base)?;
    println!(
        "{} branch mode enabled on base '{}'",
        style("ok:").green(),
        context.base_branch
    );
    Ok(())
}

pub fn status(ctx: &CmdContext) -> Result<()> {
    let mode = BranchMode::new(ctx.store.clone(), ctx.root.clone());
    match mode.load()? {
        None => println!("Branch mode is not enabled"),
        Some(context) => {
            println!(
                "Branch mode for audit {} (base '{}')",
                style(&context.audit_slug).cyan(),
                context.base_branch
            );
            for info in &context.branches {
                let mark = if info.merged {
                    style("merged").green().to_string()
                } else {
                    style("open").yellow().to_string()
                };
                println!(
                    "  {} {} {}",
                    info.branch_name,
                    info.commit_sha.as_deref().unwrap_or("(no commit)"),
                    mark
                );
            }
        }
    }
    Ok(())
}

pub fn merge(ctx: &CmdContext, strategy: MergeStrategy, target: Option<&str>) -> Result<()> {
    let mode = BranchMode::new(ctx.store.clone(), ctx.root.clone());
    let report = mode.merge_all(strategy, target)?;
    if report.merged_branches.is_empty() {
        bail!("No unmerged phase branches found");
    }
    println!(
        "{} merged {} branch(es) into '{}'",
        style("ok:").green(),
        report.merged_branches.len(),
        report.target
    );
    Ok(())
}

pub fn cleanup(ctx: &CmdContext, all: bool) -> Result<()> {
    let mode = BranchMode::new(ctx.store.clone(), ctx.root.clone());
    let report = mode.cleanup(all)?;
    println!(
        "Deleted {} branch(es); kept {}",
        report.deleted.len(),
        report.kept.len()
    );
    if let Some(hint) = &report.remote_hint {
        println!("Remote branches are untouched; to remove them: {}", hint);
    }
    Ok(())
}
