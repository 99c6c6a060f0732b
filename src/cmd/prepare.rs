//! `phaser prepare` and `phaser execute`.
//!
//! Prepare parses the audit document, persists a new audit record, and
//! splits the document into one Markdown file per phase under the
//! store's `phases/` directory (plus `setup.md` for the setup block).
//! Execute runs prepare and then drives the phase engine; the agent that
//! edits files is external, so the default executor only orchestrates
//! verification and tracking.

use super::CmdContext;
use crate::audit::{AuditParser, AuditRecord};
use crate::engine::{EngineOptions, NoopExecutor, PhaseEngine, RunSummary};
use crate::events::EventBus;
use crate::negotiate::session::render_phase;
use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug)]
pub struct PrepareOutcome {
    pub audit_id: Uuid,
    pub phase_files: Vec<std::path::PathBuf>,
}

pub fn prepare(
    ctx: &CmdContext,
    file: &Path,
    project: Option<&str>,
    force: bool,
) -> Result<PrepareOutcome> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read audit document {}", file.display()))?;
    let parsed = AuditParser::parse(&content);
    if parsed.phases.is_empty() {
        bail!(
            "{} contains no phases; check the document with 'phaser validate'",
            file.display()
        );
    }

    let phases_dir = ctx.store.phases_dir();
    if phases_dir.exists() && !force {
        let occupied = std::fs::read_dir(&phases_dir)?.next().is_some();
        if occupied {
            bail!(
                "Phase files already exist in {}; pass --force to overwrite",
                phases_dir.display()
            );
        }
    }
    std::fs::create_dir_all(&phases_dir)
        .with_context(|| format!("Failed to create {}", phases_dir.display()))?;

    let title = parsed.title.clone().unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "audit".to_string())
    });
    let mut record = AuditRecord::new(title, file.to_string_lossy());
    record.project = project.map(String::from);
    record.phases = parsed.phases.clone();
    record.warnings = parsed.warnings.clone();

    std::fs::write(phases_dir.join("setup.md"), &parsed.setup)
        .context("Failed to write setup block")?;

    let mut phase_files = Vec::new();
    for phase in &record.phases {
        let name = format!("phase-{:02}-{}.md", phase.number, phase.slug());
        let path = phases_dir.join(name);
        std::fs::write(&path, render_phase(phase, phase.number))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        phase_files.push(path);
    }

    let audit_id = ctx.store.save_audit(&record)?;
    println!(
        "Prepared audit {} ({} phase(s)) in {}",
        style(&record.slug).cyan(),
        record.phases.len(),
        phases_dir.display()
    );
    Ok(PrepareOutcome {
        audit_id,
        phase_files,
    })
}

pub struct ExecuteArgs {
    pub no_permissions: bool,
    pub force: bool,
    pub fail_fast: bool,
    pub simulate: bool,
    pub branch: bool,
}

pub async fn execute(ctx: &CmdContext, file: &Path, args: &ExecuteArgs) -> Result<RunSummary> {
    let outcome = prepare(ctx, file, None, args.force)?;
    let mut audit = ctx
        .store
        .get_audit(outcome.audit_id)?
        .context("Audit record vanished after prepare")?;

    if args.no_permissions {
        // Recorded for the agent invocation; the hook setup is external.
        audit.extra.insert(
            "no_permissions".to_string(),
            serde_json::Value::Bool(true),
        );
        ctx.store.put_audit(&audit)?;
    }

    let config = ctx.store.get_config()?;
    let options = EngineOptions {
        fail_fast: args.fail_fast,
        simulate: args.simulate,
        branch: args.branch,
        ..EngineOptions::from_config(&config)
    };
    let bus = EventBus::with_store(ctx.store.clone());
    let engine = PhaseEngine::new(ctx.store.clone(), bus, ctx.root.clone(), options);

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let summary = engine.run(&mut audit, &mut NoopExecutor).await?;
    println!(
        "Audit {}: {} completed, {} failed, {} skipped ({} ms)",
        style(audit.slug).cyan(),
        summary.phases_completed,
        summary.phases_failed,
        summary.phases_skipped,
        summary.duration_ms
    );
    Ok(summary)
}
