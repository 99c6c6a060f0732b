//! `phaser diff` — manifest capture and comparison.

use super::OutputFormat;
use crate::manifest::{self, CaptureOptions, DiffResult, Manifest};
use anyhow::{Context, Result};
use console::style;
use std::path::Path;

pub fn capture(
    root: &Path,
    excludes: &[String],
    output: Option<&Path>,
    config: &crate::config::PhaserConfig,
) -> Result<Manifest> {
    let mut options = CaptureOptions::from_config(&config.manifest);
    options.exclude.extend(excludes.iter().cloned());
    let manifest = manifest::capture(root, &options)?;

    match output {
        Some(path) => {
            manifest.save(path)?;
            println!(
                "Captured {} file(s) ({} bytes) to {}",
                manifest.file_count,
                manifest.total_size_bytes,
                path.display()
            );
        }
        None => print!("{}", manifest.to_yaml()?),
    }
    Ok(manifest)
}

pub fn compare(before: &Path, after: &Path, format: OutputFormat) -> Result<DiffResult> {
    let before = Manifest::load(before)
        .with_context(|| format!("Failed to load manifest {}", before.display()))?;
    let after = Manifest::load(after)
        .with_context(|| format!("Failed to load manifest {}", after.display()))?;
    let diff = manifest::compare(&before, &after);
    render(&diff, format)?;
    Ok(diff)
}

pub fn render(diff: &DiffResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => super::print_json(diff)?,
        OutputFormat::Summary => {
            println!(
                "{} added, {} modified, {} deleted",
                style(diff.added.len()).green(),
                style(diff.modified.len()).yellow(),
                style(diff.deleted.len()).red()
            );
        }
        OutputFormat::Detailed => {
            for change in &diff.added {
                println!("{} {}", style("A").green(), change.path);
            }
            for change in &diff.modified {
                println!("{} {}", style("M").yellow(), change.path);
                if let Some(lines) = &change.diff_lines {
                    for line in lines {
                        println!("    {}", line);
                    }
                }
            }
            for change in &diff.deleted {
                println!("{} {}", style("D").red(), change.path);
            }
        }
    }
    Ok(())
}
