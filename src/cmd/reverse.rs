//! `phaser reverse` — infer an audit from a commit range.

use super::CmdContext;
use crate::reverse::{self, GroupStrategy, ReverseOptions};
use anyhow::Result;
use console::style;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReverseMode {
    /// Render the inferred audit document.
    #[default]
    Preview,
    /// List the parsed commits.
    Commits,
    /// Show per-file change statistics.
    Diff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReverseFormat {
    #[default]
    Markdown,
    Yaml,
    Json,
}

pub fn run(
    ctx: &CmdContext,
    range: &str,
    mode: ReverseMode,
    strategy: GroupStrategy,
    format: ReverseFormat,
    max_phases: usize,
) -> Result<()> {
    let options = ReverseOptions {
        strategy,
        max_phases,
        include_merges: false,
    };

    match mode {
        ReverseMode::Commits => {
            let commits = reverse::parse_range(&ctx.root, range)?;
            for commit in &commits {
                println!(
                    "{} {} {} ({} file(s))",
                    style(&commit.info.short_hash).cyan(),
                    commit.info.date,
                    commit.info.message.lines().next().unwrap_or(""),
                    commit.files.len()
                );
            }
        }
        ReverseMode::Diff => {
            let commits = reverse::parse_range(&ctx.root, range)?;
            for commit in &commits {
                println!("{} {}", style(&commit.info.short_hash).cyan(), commit.info.message.lines().next().unwrap_or(""));
                for file in &commit.files {
                    println!(
                        "  {:<9} {} +{}/-{}",
                        format!("{:?}", file.change_type).to_lowercase(),
                        file.path,
                        file.insertions,
                        file.deletions
                    );
                }
            }
        }
        ReverseMode::Preview => {
            let audit = reverse::reverse_audit(&ctx.root, range, &options)?;
            match format {
                ReverseFormat::Markdown => print!("{}", reverse::to_markdown(&audit)),
                ReverseFormat::Yaml => print!("{}", serde_yaml::to_string(&audit)?),
                ReverseFormat::Json => super::print_json(&audit)?,
            }
        }
    }
    Ok(())
}
