//! `phaser negotiate` — non-destructive phase editing.

use super::CmdContext;
use crate::audit::AuditParser;
use crate::negotiate::{
    ModifyField, NegotiationEngine, export_markdown, load_session, save_session,
};
use anyhow::{Context, Result, bail};
use console::style;
use serde::Deserialize;
use std::path::Path;

/// Open a session for a document, resuming a saved one when present.
/// `assume_yes` skips the resume prompt (non-interactive callers).
pub fn open(ctx: &CmdContext, file: &Path, assume_yes: bool) -> Result<NegotiationEngine> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read audit document {}", file.display()))?;

    if let Some(state) = load_session(&ctx.store, &content)? {
        let resume = assume_yes
            || dialoguer::Confirm::new()
                .with_prompt(format!(
                    "A negotiation session for {} exists ({} operation(s)); resume it?",
                    file.display(),
                    state.operations.len()
                ))
                .default(true)
                .interact()
                .unwrap_or(true);
        if resume {
            return Ok(NegotiationEngine::resume(state));
        }
    }

    let parsed = AuditParser::parse(&content);
    if parsed.phases.is_empty() {
        bail!("{} contains no phases to negotiate", file.display());
    }
    Ok(NegotiationEngine::new(
        &file.to_string_lossy(),
        &content,
        parsed.phases,
    ))
}

/// One operation in a `--ops` YAML file.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpSpec {
    Split {
        phase: String,
        #[serde(default)]
        at: Option<Vec<usize>>,
    },
    Merge {
        phases: Vec<String>,
        #[serde(default)]
        force: bool,
    },
    Reorder {
        phase: String,
        position: usize,
    },
    Skip {
        phase: String,
    },
    Unskip {
        phase: String,
    },
    Modify {
        phase: String,
        field: ModifyField,
        value: serde_yaml::Value,
    },
    Reset {
        scope: String,
    },
}

/// Apply a batch of operations from a YAML document.
pub fn apply_ops(engine: &mut NegotiationEngine, ops_yaml: &str) -> Result<usize> {
    let ops: Vec<OpSpec> = serde_yaml::from_str(ops_yaml).context("Failed to parse --ops YAML")?;
    let count = ops.len();
    for op in ops {
        match op {
            OpSpec::Split { phase, at } => {
                engine.split(&phase, at)?;
            }
            OpSpec::Merge { phases, force } => {
                engine.merge(&phases, force)?;
            }
            OpSpec::Reorder { phase, position } => engine.reorder(&phase, position)?,
            OpSpec::Skip { phase } => engine.skip(&phase)?,
            OpSpec::Unskip { phase } => engine.unskip(&phase)?,
            OpSpec::Modify {
                phase,
                field,
                value,
            } => engine.modify(&phase, field, value)?,
            OpSpec::Reset { scope } => engine.reset(&scope)?,
        }
    }
    Ok(count)
}

pub fn preview(engine: &NegotiationEngine) {
    for phase in &engine.state.current_phases {
        let marker = if engine.state.skipped_ids.contains(&phase.id) {
            style("[SKIPPED]").yellow().to_string()
        } else {
            format!("[{}]", phase.number)
        };
        println!(
            "{:<12} {:<12} {} ({} file(s))",
            marker,
            phase.id,
            phase.title,
            phase.files.len()
        );
    }
}

pub fn status(engine: &NegotiationEngine) {
    let state = &engine.state;
    println!(
        "Session for {} — {} phase(s), {} skipped, {} operation(s)",
        state.source_file,
        state.current_phases.len(),
        state.skipped_ids.len(),
        state.operations.len()
    );
    for op in &state.operations {
        println!("  {} {}", op.timestamp, op.description);
    }
}

/// Persist the session and report where it went.
pub fn save(ctx: &CmdContext, engine: &NegotiationEngine) -> Result<()> {
    let path = save_session(&ctx.store, &engine.state)?;
    println!("Session saved to {}", path.display());
    Ok(())
}

pub fn export(
    engine: &NegotiationEngine,
    include_skipped: bool,
    output: Option<&Path>,
) -> Result<()> {
    let markdown = export_markdown(&engine.state, include_skipped);
    match output {
        Some(path) => {
            std::fs::write(path, &markdown)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported negotiated audit to {}", path.display());
        }
        None => print!("{}", markdown),
    }
    Ok(())
}
