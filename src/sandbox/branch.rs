//! Per-phase branch mode.
//!
//! One linear chain of branches per audit, one branch per phase, each
//! rooted at the previous phase branch (the first at the recorded base).
//! Merging back applies a closed set of strategies; cleanup deletes the
//! local branches. Remote branches are never touched.

use crate::errors::SandboxError;
use crate::store::Store;
use anyhow::{Context, Result};
use git2::build::CheckoutBuilder;
use git2::{Commit, Repository};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Branch names are capped here; longer phase slugs are truncated with a
/// hash suffix so names stay unique.
const MAX_BRANCH_NAME_LEN: usize = 100;

/// How phase branches land back on the target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// One squash commit for the whole audit.
    #[default]
    Squash,
    /// Replay each phase's commits onto the target, then fast-forward.
    Rebase,
    /// One no-ff merge commit per phase.
    Merge,
}

/// One phase branch in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub phase_num: u32,
    pub phase_slug: String,
    pub branch_name: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub merged: bool,
}

/// Persisted branch-mode state (`branches.yaml`), one active per root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchContext {
    pub audit_id: Uuid,
    pub audit_slug: String,
    pub root: String,
    pub base_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<u32>,
    #[serde(default)]
    pub branches: Vec<BranchInfo>,
    pub active: bool,
}

/// Compose a phase branch name, enforcing the length invariant.
pub fn branch_name(audit_slug: &str, phase_num: u32, phase_slug: &str) -> String {
    let full = format!("audit/{}/phase-{:02}-{}", audit_slug, phase_num, phase_slug);
    if full.len() <= MAX_BRANCH_NAME_LEN {
        return full;
    }
    let prefix = format!("audit/{}/phase-{:02}-", audit_slug, phase_num);
    let hash = crate::util::short_hash(phase_slug.as_bytes());
    let suffix = &hash[..6];
    let budget = MAX_BRANCH_NAME_LEN.saturating_sub(prefix.len() + suffix.len() + 1);
    let truncated: String = phase_slug.chars().take(budget).collect();
    format!("{}{}-{}", prefix, truncated, suffix)
}

/// Outcome of a merge pass.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub merged_branches: Vec<String>,
    pub target: String,
}

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub kept: Vec<String>,
    /// Suggested command for the remote side; never executed.
    pub remote_hint: Option<String>,
}

pub struct BranchMode {
    store: Store,
    root: PathBuf,
}

impl BranchMode {
    pub fn new(store: Store, root: PathBuf) -> Self {
        Self { store, root }
    }

    fn open_repo(&self) -> Result<Repository, SandboxError> {
        Repository::open(&self.root).map_err(|_| SandboxError::NotARepository {
            path: self.root.clone(),
        })
    }

    /// Enable branch mode: requires a clean tree and an attached HEAD.
    pub fn begin(
        &self,
        audit_id: Uuid,
        audit_slug: &str,
        base: Option<&str>,
    ) -> Result<BranchContext> {
        let repo = self.open_repo()?;
        if let Some(existing) = self.load()?
            && existing.active
        {
            return Err(SandboxError::BranchModeActive {
                context_path: self.store.branches_file(),
            }
            .into());
        }
        if repo.head_detached().unwrap_or(false) {
            return Err(SandboxError::DetachedHead.into());
        }
        if is_dirty(&repo)? {
            return Err(SandboxError::DirtyWorkingTree.into());
        }

        let base_branch = match base {
            Some(base) => base.to_string(),
            None => repo
                .head()
                .ok()
                .and_then(|h| h.shorthand().map(String::from))
                .ok_or(SandboxError::DetachedHead)?,
        };

        let context = BranchContext {
            audit_id,
            audit_slug: audit_slug.to_string(),
            root: self.root.to_string_lossy().to_string(),
            base_branch,
            current_phase: None,
            branches: Vec::new(),
            active: true,
        };
        self.save(&context)?;
        Ok(context)
    }

    /// Create and check out the branch for one phase. Its base is the
    /// previous phase branch, or the recorded base for the first phase.
    pub fn create_phase_branch(&self, phase_num: u32, phase_slug: &str) -> Result<String> {
        let repo = self.open_repo()?;
        let mut context = self.require_context()?;

        let base_name = context
            .branches
            .last()
            .map(|b| b.branch_name.clone())
            .unwrap_or_else(|| context.base_branch.clone());
        let base_commit = branch_commit(&repo, &base_name)?;

        let name = branch_name(&context.audit_slug, phase_num, phase_slug);
        repo.branch(&name, &base_commit, false)
            .map_err(SandboxError::Git)?;
        checkout_branch(&repo, &name).map_err(SandboxError::Git)?;

        context.branches.push(BranchInfo {
            phase_num,
            phase_slug: phase_slug.to_string(),
            branch_name: name.clone(),
            created_at: crate::util::now_iso(),
            commit_sha: None,
            merged: false,
        });
        context.current_phase = Some(phase_num);
        self.save(&context)?;
        Ok(name)
    }

    /// Stage everything and commit the current phase branch. Returns the
    /// commit SHA, or `None` when there is nothing to commit — an empty
    /// phase never produces an empty commit.
    pub fn commit_phase(
        &self,
        phase_num: u32,
        title: &str,
        message: Option<&str>,
    ) -> Result<Option<String>> {
        let repo = self.open_repo()?;
        let mut context = self.require_context()?;

        let mut index = repo.index().map_err(SandboxError::Git)?;
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .map_err(SandboxError::Git)?;
        index.write().map_err(SandboxError::Git)?;
        let tree_id = index.write_tree().map_err(SandboxError::Git)?;

        let head = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(SandboxError::Git)?;
        if head.tree_id() == tree_id {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id).map_err(SandboxError::Git)?;
        let sig = repo
            .signature()
            .or_else(|_| git2::Signature::now("phaser", "phaser@localhost"))
            .map_err(SandboxError::Git)?;
        let default_message = format!("Phase {}: {}", phase_num, title);
        let message = message.unwrap_or(&default_message);
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&head])
            .map_err(SandboxError::Git)?;

        if let Some(info) = context
            .branches
            .iter_mut()
            .find(|b| b.phase_num == phase_num)
        {
            info.commit_sha = Some(oid.to_string());
        }
        self.save(&context)?;
        Ok(Some(oid.to_string()))
    }

    /// Merge every unmerged phase branch into the target (default: the
    /// recorded base). On conflict the pass stops with the conflicting
    /// paths; the context stays on disk so the merge is resumable.
    pub fn merge_all(&self, strategy: MergeStrategy, target: Option<&str>) -> Result<MergeReport> {
        let repo = self.open_repo()?;
        let mut context = self.require_context()?;
        let target_name = target.unwrap_or(&context.base_branch).to_string();

        checkout_branch(&repo, &target_name).map_err(SandboxError::Git)?;
        let original_head = branch_commit(&repo, &target_name)?;
        let mut current_head = original_head.id();
        let mut report = MergeReport {
            merged_branches: Vec::new(),
            target: target_name.clone(),
        };

        let sig = repo
            .signature()
            .or_else(|_| git2::Signature::now("phaser", "phaser@localhost"))
            .map_err(SandboxError::Git)?;

        let pending: Vec<BranchInfo> = context
            .branches
            .iter()
            .filter(|b| !b.merged)
            .cloned()
            .collect();
        let mut prev_tip = original_head.id();

        for info in &pending {
            let branch_head = branch_commit(&repo, &info.branch_name)?;
            let merge_result = match strategy {
                MergeStrategy::Squash | MergeStrategy::Merge => merge_one(
                    &repo,
                    &sig,
                    current_head,
                    &branch_head,
                    strategy,
                    &info.branch_name,
                ),
                MergeStrategy::Rebase => {
                    cherry_pick_range(&repo, &sig, current_head, prev_tip, &branch_head)
                }
            };
            current_head = match merge_result {
                Ok(oid) => oid,
                Err(e) => {
                    // Persist progress so the merge can resume after the
                    // conflict is resolved.
                    self.save(&context)?;
                    return Err(e);
                }
            };
            prev_tip = branch_head.id();

            if let Some(slot) = context
                .branches
                .iter_mut()
                .find(|b| b.branch_name == info.branch_name)
            {
                slot.merged = true;
            }
            report.merged_branches.push(info.branch_name.clone());
            self.save(&context)?;
        }

        if strategy == MergeStrategy::Squash && current_head != original_head.id() {
            // Collapse the accumulated tree into one commit on the target.
            let final_tree = repo
                .find_commit(current_head)
                .and_then(|c| c.tree())
                .map_err(SandboxError::Git)?;
            let message = squash_message(&context.audit_slug, &report.merged_branches);
            current_head = repo
                .commit(None, &sig, &sig, &message, &final_tree, &[&original_head])
                .map_err(SandboxError::Git)?;
        }

        repo.reference(
            &format!("refs/heads/{}", target_name),
            current_head,
            true,
            "phaser merge_all",
        )
        .map_err(SandboxError::Git)?;
        checkout_branch(&repo, &target_name).map_err(SandboxError::Git)?;
        Ok(report)
    }

    /// Delete phase branches. Merged-only by default; `all` forces every
    /// branch. Remote branches are left alone — the report carries the
    /// equivalent remote command instead.
    pub fn cleanup(&self, all: bool) -> Result<CleanupReport> {
        let repo = self.open_repo()?;
        let mut context = self.require_context()?;

        // Never delete the branch that is checked out.
        checkout_branch(&repo, &context.base_branch).map_err(SandboxError::Git)?;

        let mut report = CleanupReport::default();
        for info in &context.branches {
            if !info.merged && !all {
                report.kept.push(info.branch_name.clone());
                continue;
            }
            match repo.find_branch(&info.branch_name, git2::BranchType::Local) {
                Ok(mut branch) => {
                    branch.delete().map_err(SandboxError::Git)?;
                    report.deleted.push(info.branch_name.clone());
                }
                Err(_) => report.deleted.push(info.branch_name.clone()),
            }
        }
        if !report.deleted.is_empty() {
            report.remote_hint = Some(format!(
                "git push origin --delete {}",
                report.deleted.join(" ")
            ));
        }

        context
            .branches
            .retain(|b| !report.deleted.contains(&b.branch_name));
        if context.branches.is_empty() {
            let path = self.store.branches_file();
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        } else {
            self.save(&context)?;
        }
        Ok(report)
    }

    pub fn load(&self) -> Result<Option<BranchContext>> {
        let path = self.store.branches_file();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let context = serde_yaml::from_str(&content)
            .with_context(|| format!("Corrupt branch context {}", path.display()))?;
        Ok(Some(context))
    }

    fn require_context(&self) -> Result<BranchContext> {
        self.load()?.filter(|c| c.active).ok_or_else(|| {
            anyhow::anyhow!("Branch mode is not enabled; run 'phaser branches enable' first")
        })
    }

    pub fn save(&self, context: &BranchContext) -> Result<()> {
        let yaml = serde_yaml::to_string(context).context("Failed to serialize branch context")?;
        crate::store::lock::write_locked(&self.store.branches_file(), &yaml)?;
        Ok(())
    }
}

fn is_dirty(repo: &Repository) -> Result<bool, SandboxError> {
    let mut options = git2::StatusOptions::new();
    options.include_untracked(true).include_ignored(false);
    let statuses = repo.statuses(Some(&mut options)).map_err(SandboxError::Git)?;
    Ok(!statuses.is_empty())
}

fn branch_commit<'repo>(
    repo: &'repo Repository,
    name: &str,
) -> Result<Commit<'repo>, SandboxError> {
    repo.find_branch(name, git2::BranchType::Local)
        .and_then(|b| b.get().peel_to_commit())
        .map_err(SandboxError::Git)
}

fn checkout_branch(repo: &Repository, name: &str) -> Result<(), git2::Error> {
    repo.set_head(&format!("refs/heads/{}", name))?;
    let mut builder = CheckoutBuilder::new();
    builder.force();
    repo.checkout_head(Some(&mut builder))
}

fn conflict_paths(index: &git2::Index) -> Vec<String> {
    let Ok(conflicts) = index.conflicts() else {
        return Vec::new();
    };
    conflicts
        .filter_map(|c| c.ok())
        .filter_map(|c| c.our.or(c.their))
        .map(|entry| String::from_utf8_lossy(&entry.path).to_string())
        .collect()
}

/// Merge one branch head onto `current_head`. Squash produces an
/// intermediate single-parent commit (collapsed later); merge produces a
/// two-parent no-ff commit.
fn merge_one(
    repo: &Repository,
    sig: &git2::Signature<'_>,
    current_head: git2::Oid,
    branch_head: &Commit<'_>,
    strategy: MergeStrategy,
    branch_name: &str,
) -> Result<git2::Oid> {
    let current = repo.find_commit(current_head).map_err(SandboxError::Git)?;
    let mut index = repo
        .merge_commits(&current, branch_head, None)
        .map_err(SandboxError::Git)?;
    if index.has_conflicts() {
        return Err(SandboxError::MergeConflict {
            branch: branch_name.to_string(),
            paths: conflict_paths(&index),
        }
        .into());
    }
    let tree_id = index.write_tree_to(repo).map_err(SandboxError::Git)?;
    let tree = repo.find_tree(tree_id).map_err(SandboxError::Git)?;

    let oid = match strategy {
        MergeStrategy::Merge => repo
            .commit(
                None,
                sig,
                sig,
                &format!("Merge branch '{}'", branch_name),
                &tree,
                &[&current, branch_head],
            )
            .map_err(SandboxError::Git)?,
        _ => repo
            .commit(
                None,
                sig,
                sig,
                &format!("Apply '{}'", branch_name),
                &tree,
                &[&current],
            )
            .map_err(SandboxError::Git)?,
    };
    Ok(oid)
}

/// Rebase semantics: replay the commits a branch added over its chain
/// predecessor onto `current_head`, oldest first.
fn cherry_pick_range(
    repo: &Repository,
    sig: &git2::Signature<'_>,
    current_head: git2::Oid,
    prev_tip: git2::Oid,
    branch_head: &Commit<'_>,
) -> Result<git2::Oid> {
    let mut walk = repo.revwalk().map_err(SandboxError::Git)?;
    walk.push(branch_head.id()).map_err(SandboxError::Git)?;
    walk.hide(prev_tip).map_err(SandboxError::Git)?;
    walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::REVERSE)
        .map_err(SandboxError::Git)?;

    let mut head = current_head;
    for oid in walk {
        let oid = oid.map_err(SandboxError::Git)?;
        let commit = repo.find_commit(oid).map_err(SandboxError::Git)?;
        let onto = repo.find_commit(head).map_err(SandboxError::Git)?;
        let mut index = repo
            .cherrypick_commit(&commit, &onto, 0, None)
            .map_err(SandboxError::Git)?;
        if index.has_conflicts() {
            return Err(SandboxError::MergeConflict {
                branch: commit.id().to_string(),
                paths: conflict_paths(&index),
            }
            .into());
        }
        let tree_id = index.write_tree_to(repo).map_err(SandboxError::Git)?;
        let tree = repo.find_tree(tree_id).map_err(SandboxError::Git)?;
        head = repo
            .commit(
                None,
                &commit.author(),
                sig,
                commit.message().unwrap_or("phase commit"),
                &tree,
                &[&onto],
            )
            .map_err(SandboxError::Git)?;
    }
    Ok(head)
}

fn squash_message(audit_slug: &str, branches: &[String]) -> String {
    let mut message = format!("Audit {}: squash of {} phase(s)\n", audit_slug, branches.len());
    for branch in branches {
        message.push_str(&format!("\n- {}", branch));
    }
    message
}
