//! `phaser simulate` — sandbox control.

use super::CmdContext;
use crate::audit::PhaseStatus;
use crate::engine::{EngineOptions, NoopExecutor, PhaseEngine, RunSummary};
use crate::events::EventBus;
use crate::sandbox::Simulation;
use anyhow::{Context, Result, bail};
use console::style;

/// Parse a `--phases` range like `2`, `1-3`, or `2..4` into phase numbers.
pub fn parse_phase_range(range: &str) -> Result<(u32, u32)> {
    let parts: Vec<&str> = if range.contains("..") {
        range.splitn(2, "..").collect()
    } else if range.contains('-') {
        range.splitn(2, '-').collect()
    } else {
        vec![range, range]
    };
    let start: u32 = parts[0].trim().parse().context("Invalid phase range start")?;
    let end: u32 = parts[1].trim().parse().context("Invalid phase range end")?;
    if start == 0 || end < start {
        bail!("Phase range must be ascending and 1-based: '{}'", range);
    }
    Ok((start, end))
}

pub struct SimulateRunArgs {
    pub phases: Option<String>,
    pub commit_on_success: bool,
}

/// Run the most recent pending audit inside a simulation.
pub async fn run(ctx: &CmdContext, args: &SimulateRunArgs) -> Result<RunSummary> {
    let mut audits = ctx.store.list_audits(None)?;
    audits.retain(|a| !a.status.is_terminal());
    let Some(mut audit) = audits.into_iter().next() else {
        bail!("No pending audit found; run 'phaser prepare <file>' first");
    };

    if let Some(range) = &args.phases {
        let (start, end) = parse_phase_range(range)?;
        for phase in &mut audit.phases {
            if phase.status == PhaseStatus::Pending
                && (phase.number < start || phase.number > end)
            {
                phase.status = PhaseStatus::Skipped;
            }
        }
    }

    let config = ctx.store.get_config()?;
    let options = EngineOptions {
        simulate: true,
        ..EngineOptions::from_config(&config)
    };
    let bus = EventBus::with_store(ctx.store.clone());
    let engine = PhaseEngine::new(ctx.store.clone(), bus, ctx.root.clone(), options);
    let summary = engine.run(&mut audit, &mut NoopExecutor).await?;

    let simulation = Simulation::new(ctx.store.clone(), ctx.root.clone());
    if args.commit_on_success && summary.phases_failed == 0 {
        simulation.commit()?;
        println!("{} simulation committed", style("ok:").green());
    } else {
        println!(
            "Simulation left active; inspect with 'phaser simulate status', then rollback or commit"
        );
    }
    Ok(summary)
}

pub fn rollback(ctx: &CmdContext) -> Result<()> {
    let simulation = Simulation::new(ctx.store.clone(), ctx.root.clone());
    let outcome = simulation.rollback()?;
    if outcome.ok {
        println!("{} simulation rolled back", style("ok:").green());
        Ok(())
    } else {
        bail!(
            "Rollback incomplete; could not restore: {}",
            outcome.failed_paths.join(", ")
        )
    }
}

pub fn commit(ctx: &CmdContext) -> Result<()> {
    let simulation = Simulation::new(ctx.store.clone(), ctx.root.clone());
    if simulation.commit()? {
        println!("{} simulation changes kept", style("ok:").green());
        Ok(())
    } else {
        bail!("No active simulation to commit")
    }
}

pub fn status(ctx: &CmdContext) -> Result<()> {
    let simulation = Simulation::new(ctx.store.clone(), ctx.root.clone());
    match simulation.load()? {
        None => println!("No active simulation"),
        Some(context) => {
            println!(
                "Simulation for audit {} (started {})",
                style(context.audit_id).cyan(),
                context.started_at
            );
            println!(
                "  created: {}  modified: {}  deleted: {}",
                context.created_files.len(),
                context.modified_files.len(),
                context.deleted_files.len()
            );
            if let Some(stash) = &context.stash_ref {
                println!("  stashed prior work: {}", stash);
            }
        }
    }
    Ok(())
}
