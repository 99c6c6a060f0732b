//! `phaser replay` — regression check of a completed audit.
//!
//! Replays a completed audit against the current tree: the `files` scope
//! compares the tree to the audit's post-execution manifest and flags
//! drift; the `contracts` scope re-runs every enabled contract. Each run
//! is appended to the replay history.

use super::{CmdContext, OutputFormat};
use crate::contracts::Severity;
use crate::manifest::{self, CaptureOptions, Manifest};
use crate::store::ReplayRecord;
use anyhow::{Context, Result, bail};
use console::style;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReplayScope {
    #[default]
    All,
    Contracts,
    Files,
}

impl ReplayScope {
    fn as_str(&self) -> &'static str {
        match self {
            ReplayScope::All => "all",
            ReplayScope::Contracts => "contracts",
            ReplayScope::Files => "files",
        }
    }
}

pub fn run(ctx: &CmdContext, slug: &str, scope: ReplayScope) -> Result<Vec<String>> {
    let audit = ctx
        .store
        .find_audit_by_slug(slug)?
        .with_context(|| format!("No audit with slug '{}'", slug))?;
    if !audit.status.is_terminal() {
        bail!(
            "Audit '{}' is still {}; replay only checks finished audits",
            slug,
            audit.status
        );
    }

    let mut regressions = Vec::new();

    if matches!(scope, ReplayScope::All | ReplayScope::Files) {
        let post_path = ctx.store.manifests_dir(audit.id).join("post.yaml");
        if !post_path.exists() {
            bail!(
                "No post-execution manifest for '{}' at {}",
                slug,
                post_path.display()
            );
        }
        let post = Manifest::load(&post_path)?;
        let config = ctx.store.get_config()?;
        let current = manifest::capture(&ctx.root, &CaptureOptions::from_config(&config.manifest))?;
        let drift = manifest::compare(&post, &current);
        for change in drift
            .added
            .iter()
            .chain(drift.modified.iter())
            .chain(drift.deleted.iter())
        {
            regressions.push(format!("file drift: {}", change.path));
        }
    }

    if matches!(scope, ReplayScope::All | ReplayScope::Contracts) {
        let violations = super::contracts::check(ctx, OutputFormat::Summary)?;
        for violation in violations {
            if violation.severity == Severity::Error {
                regressions.push(format!(
                    "contract {}: {}:{}",
                    violation.rule_id,
                    violation.file_path,
                    violation.line_number.unwrap_or(1)
                ));
            }
        }
    }

    ctx.store.append_replay(&ReplayRecord {
        audit_id: audit.id,
        slug: slug.to_string(),
        timestamp: crate::util::now_iso(),
        scope: scope.as_str().to_string(),
        regressions: regressions.clone(),
    })?;

    if regressions.is_empty() {
        println!("{} no regressions for '{}'", style("ok:").green(), slug);
    } else {
        println!(
            "{} {} regression(s) for '{}':",
            style("fail:").red(),
            regressions.len(),
            slug
        );
        for regression in &regressions {
            println!("  {}", regression);
        }
    }
    Ok(regressions)
}
