//! `phaser validate` — parse and sanity-check an audit document.

use crate::audit::AuditParser;
use anyhow::{Context, Result};
use console::style;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub file: String,
    pub phase_count: usize,
    pub warnings: Vec<String>,
    pub valid: bool,
}

/// Validate a document. Warnings fail validation only under `--strict`.
pub fn run(file: &Path, strict: bool, json: bool) -> Result<ValidationReport> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read audit document {}", file.display()))?;
    let parsed = AuditParser::parse(&content);

    let mut warnings = parsed.warnings.clone();
    for phase in &parsed.phases {
        warnings.extend(phase.parse_warnings.iter().cloned());
    }
    if parsed.phases.is_empty() {
        warnings.push("document contains no phases".to_string());
    }
    for (idx, phase) in parsed.phases.iter().enumerate() {
        let expected = (idx + 1) as u32;
        if phase.number != expected {
            warnings.push(format!(
                "phase numbering gap: found Phase {} where Phase {} was expected",
                phase.number, expected
            ));
        }
    }

    let hard_failure = parsed.phases.is_empty();
    let valid = !hard_failure && (!strict || warnings.is_empty());
    let report = ValidationReport {
        file: file.to_string_lossy().to_string(),
        phase_count: parsed.phases.len(),
        warnings,
        valid,
    };

    if json {
        super::print_json(&report)?;
    } else {
        let verdict = if report.valid {
            style("valid").green().to_string()
        } else {
            style("invalid").red().to_string()
        };
        println!(
            "{}: {} phase(s), {} warning(s) — {}",
            report.file,
            report.phase_count,
            report.warnings.len(),
            verdict
        );
        for warning in &report.warnings {
            println!("  {} {}", style("warning:").yellow(), warning);
        }
    }
    Ok(report)
}
