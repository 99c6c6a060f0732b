//! Git-stash-backed simulation sandbox.
//!
//! A simulation lets an audit run without persisting its changes. Prior
//! uncommitted work is stashed, file changes are tracked phase by phase,
//! and rollback reverses everything: tracked created files are deleted,
//! tracked modified and deleted files are checked out from HEAD, and the
//! stash is popped. Created files outside git tracking are deleted on
//! rollback; modified *untracked* files cannot be restored — rollback
//! reports them instead of pretending.
//!
//! Only one simulation can be active per project root; the persisted
//! context (`simulation.yaml`) makes an interrupted simulation
//! resumable.

use crate::errors::SandboxError;
use crate::manifest::DiffResult;
use crate::store::Store;
use anyhow::{Context, Result};
use git2::Repository;
use git2::build::CheckoutBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Persisted state of one active simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationContext {
    pub audit_id: Uuid,
    pub root: String,
    pub original_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stash_ref: Option<String>,
    #[serde(default)]
    pub created_files: Vec<String>,
    #[serde(default)]
    pub modified_files: Vec<String>,
    #[serde(default)]
    pub deleted_files: Vec<String>,
    pub started_at: String,
    pub active: bool,
}

/// Result of a rollback attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollbackOutcome {
    pub ok: bool,
    /// Paths that could not be restored.
    pub failed_paths: Vec<String>,
}

pub struct Simulation {
    store: Store,
    root: PathBuf,
}

impl Simulation {
    pub fn new(store: Store, root: PathBuf) -> Self {
        Self { store, root }
    }

    fn open_repo(&self) -> Result<Repository, SandboxError> {
        Repository::open(&self.root).map_err(|_| SandboxError::NotARepository {
            path: self.root.clone(),
        })
    }

    /// Begin a simulation: verify the root is a work tree, reject a
    /// second active context, stash prior uncommitted work, persist.
    pub fn begin(&self, audit_id: Uuid) -> Result<SimulationContext> {
        let mut repo = self.open_repo()?;
        if let Some(existing) = self.load()?
            && existing.active
        {
            return Err(SandboxError::SimulationActive {
                context_path: self.store.simulation_file(),
            }
            .into());
        }

        let original_branch = repo
            .head()
            .ok()
            .and_then(|h| h.shorthand().map(String::from))
            .unwrap_or_else(|| "HEAD".to_string());

        let stash_ref = if is_dirty(&repo)? {
            let sig = repo
                .signature()
                .or_else(|_| git2::Signature::now("phaser", "phaser@localhost"))
                .map_err(SandboxError::Git)?;
            let oid = repo
                .stash_save(
                    &sig,
                    &format!("phaser simulation for audit {}", audit_id),
                    Some(git2::StashFlags::INCLUDE_UNTRACKED),
                )
                .map_err(SandboxError::Git)?;
            Some(oid.to_string())
        } else {
            None
        };

        let context = SimulationContext {
            audit_id,
            root: self.root.to_string_lossy().to_string(),
            original_branch,
            stash_ref,
            created_files: Vec::new(),
            modified_files: Vec::new(),
            deleted_files: Vec::new(),
            started_at: crate::util::now_iso(),
            active: true,
        };
        self.save(&context)?;
        Ok(context)
    }

    /// Record the file changes of one phase into the context.
    /// Duplicates are ignored.
    pub fn track(&self, context: &mut SimulationContext, diff: &DiffResult) -> Result<()> {
        for change in &diff.added {
            push_unique(&mut context.created_files, &change.path);
        }
        for change in &diff.modified {
            push_unique(&mut context.modified_files, &change.path);
        }
        for change in &diff.deleted {
            push_unique(&mut context.deleted_files, &change.path);
        }
        self.save(context)
    }

    /// Best-effort reversal: delete created files, check out modified
    /// and deleted files from HEAD, pop the stash. Idempotent on an
    /// inactive context.
    pub fn rollback(&self) -> Result<RollbackOutcome> {
        let Some(context) = self.load()? else {
            return Ok(RollbackOutcome {
                ok: true,
                failed_paths: Vec::new(),
            });
        };
        if !context.active {
            self.remove()?;
            return Ok(RollbackOutcome {
                ok: true,
                failed_paths: Vec::new(),
            });
        }

        let mut repo = self.open_repo()?;
        let mut failed = Vec::new();

        for path in &context.created_files {
            let abs = self.root.join(path);
            if abs.exists() && std::fs::remove_file(&abs).is_err() {
                failed.push(path.clone());
            }
        }

        for path in context.modified_files.iter().chain(&context.deleted_files) {
            if checkout_path(&repo, path).is_err() {
                failed.push(path.clone());
            }
        }

        if let Some(stash_ref) = &context.stash_ref
            && pop_stash(&mut repo, stash_ref).is_err()
        {
            failed.push(format!("stash {}", stash_ref));
        }

        if failed.is_empty() {
            self.remove()?;
        } else {
            // Keep the file but mark it inactive so a retry cannot
            // corrupt the tree further.
            let mut context = context;
            context.active = false;
            self.save(&context)?;
        }

        Ok(RollbackOutcome {
            ok: failed.is_empty(),
            failed_paths: failed,
        })
    }

    /// Keep the simulated changes: drop the stash and clear the context.
    /// Prior uncommitted work in the stash is discarded.
    pub fn commit(&self) -> Result<bool> {
        let Some(context) = self.load()? else {
            return Ok(false);
        };
        if let Some(stash_ref) = &context.stash_ref {
            let mut repo = self.open_repo()?;
            drop_stash(&mut repo, stash_ref)?;
        }
        self.remove()?;
        Ok(true)
    }

    pub fn load(&self) -> Result<Option<SimulationContext>> {
        let path = self.store.simulation_file();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let context = serde_yaml::from_str(&content)
            .with_context(|| format!("Corrupt simulation context {}", path.display()))?;
        Ok(Some(context))
    }

    pub fn save(&self, context: &SimulationContext) -> Result<()> {
        let yaml = serde_yaml::to_string(context).context("Failed to serialize simulation")?;
        crate::store::lock::write_locked(&self.store.simulation_file(), &yaml)?;
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let path = self.store.simulation_file();
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

fn push_unique(list: &mut Vec<String>, path: &str) {
    if !list.iter().any(|p| p == path) {
        list.push(path.to_string());
    }
}

fn is_dirty(repo: &Repository) -> Result<bool, SandboxError> {
    let mut options = git2::StatusOptions::new();
    options.include_untracked(true).include_ignored(false);
    let statuses = repo.statuses(Some(&mut options)).map_err(SandboxError::Git)?;
    Ok(!statuses.is_empty())
}

fn checkout_path(repo: &Repository, path: &str) -> Result<(), git2::Error> {
    let mut builder = CheckoutBuilder::new();
    builder.force().update_index(true).path(path);
    repo.checkout_head(Some(&mut builder))
}

fn find_stash_index(repo: &mut Repository, stash_ref: &str) -> Result<Option<usize>, git2::Error> {
    let mut found = None;
    repo.stash_foreach(|index, _message, oid| {
        if oid.to_string() == stash_ref {
            found = Some(index);
            false
        } else {
            true
        }
    })?;
    Ok(found)
}

fn pop_stash(repo: &mut Repository, stash_ref: &str) -> Result<(), git2::Error> {
    if let Some(index) = find_stash_index(repo, stash_ref)? {
        repo.stash_pop(index, None)?;
    }
    Ok(())
}

fn drop_stash(repo: &mut Repository, stash_ref: &str) -> Result<()> {
    if let Some(index) = find_stash_index(repo, stash_ref).map_err(SandboxError::Git)? {
        repo.stash_drop(index).map_err(SandboxError::Git)?;
    }
    Ok(())
}

/// Scoped simulation with guaranteed teardown. The default exit path is
/// rollback; call [`SimulationGuard::keep`] before scope end to commit
/// instead.
pub struct SimulationGuard {
    simulation: Simulation,
    pub context: SimulationContext,
    keep: bool,
    finished: bool,
}

impl SimulationGuard {
    pub fn begin(store: Store, root: PathBuf, audit_id: Uuid) -> Result<Self> {
        let simulation = Simulation::new(store, root);
        let context = simulation.begin(audit_id)?;
        Ok(Self {
            simulation,
            context,
            keep: false,
            finished: false,
        })
    }

    pub fn track(&mut self, diff: &DiffResult) -> Result<()> {
        let Self {
            simulation,
            context,
            ..
        } = self;
        simulation.track(context, diff)
    }

    /// Switch the teardown from rollback to commit.
    pub fn keep(&mut self) {
        self.keep = true;
    }

    /// Explicit teardown with error propagation.
    pub fn finish(mut self) -> Result<RollbackOutcome> {
        self.finished = true;
        if self.keep {
            self.simulation.commit()?;
            Ok(RollbackOutcome {
                ok: true,
                failed_paths: Vec::new(),
            })
        } else {
            self.simulation.rollback()
        }
    }
}

impl Drop for SimulationGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let result = if self.keep {
            self.simulation.commit().map(|_| ())
        } else {
            self.simulation.rollback().map(|_| ())
        };
        if let Err(e) = result {
            tracing::warn!("simulation teardown failed: {:#}", e);
        }
    }
}
