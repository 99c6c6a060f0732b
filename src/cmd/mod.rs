//! CLI command handlers, one module per command family.

pub mod analytics;
pub mod branches;
pub mod config;
pub mod contracts;
pub mod diff;
pub mod enforce;
pub mod negotiate;
pub mod prepare;
pub mod replay;
pub mod reverse;
pub mod simulate;
pub mod validate;

use crate::store::Store;
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Shared command context: the project root and its store handle.
pub struct CmdContext {
    pub root: PathBuf,
    pub store: Store,
}

impl CmdContext {
    pub fn new(project_dir: Option<PathBuf>) -> Result<Self> {
        let root = match project_dir {
            Some(dir) => dir
                .canonicalize()
                .with_context(|| format!("Failed to resolve project dir {}", dir.display()))?,
            None => std::env::current_dir().context("Failed to get current directory")?,
        };
        let store = Store::open(&root)?;
        Ok(Self { root, store })
    }
}

/// Machine-readable output formats shared across commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Summary,
    Detailed,
    Json,
}

/// Serialize a value as the whole stdout payload.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}
