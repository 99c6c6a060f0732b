//! Reverse audit: infer an audit-shaped document from git history.
//!
//! A commit range is parsed into per-commit file changes (rename
//! detection included, merge commits excluded by default), grouped into
//! phases by one of four strategies, and rendered as an audit document.

use crate::errors::SandboxError;
use anyhow::{Context, Result};
use git2::{Delta, DiffFindOptions, DiffOptions, Repository};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default ceiling on inferred phases.
pub const DEFAULT_MAX_PHASES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GroupStrategy {
    /// One phase per commit.
    Commits,
    /// Group by top-level directory, largest first.
    Directories,
    /// Group by file extension, largest first.
    Filetypes,
    /// Group by conventional-commit type with keyword fallback.
    #[default]
    Semantic,
}

/// Inferred change categories, in their stable output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Feature,
    Fix,
    Refactor,
    Test,
    Docs,
    Chore,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Feature => "feature",
            Category::Fix => "fix",
            Category::Refactor => "refactor",
            Category::Test => "test",
            Category::Docs => "docs",
            Category::Chore => "chore",
            Category::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// One file touched by one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitFileChange {
    pub path: String,
    pub change_type: CommitChangeType,
    pub insertions: usize,
    pub deletions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub short_hash: String,
    pub author: String,
    pub date: String,
    pub message: String,
}

/// One parsed commit with its file changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedCommit {
    pub info: CommitInfo,
    pub files: Vec<CommitFileChange>,
}

impl ParsedCommit {
    fn subject(&self) -> &str {
        self.info.message.lines().next().unwrap_or("")
    }
}

/// One inferred phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredPhase {
    pub number: u32,
    pub title: String,
    pub category: Category,
    pub commits: Vec<CommitInfo>,
    pub files: Vec<CommitFileChange>,
    pub insertions: usize,
    pub deletions: usize,
}

/// The reverse-audit result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseAudit {
    pub range: String,
    pub strategy: GroupStrategy,
    pub phases: Vec<InferredPhase>,
}

/// Options for a reverse-audit run.
#[derive(Debug, Clone)]
pub struct ReverseOptions {
    pub strategy: GroupStrategy,
    pub max_phases: usize,
    pub include_merges: bool,
}

impl Default for ReverseOptions {
    fn default() -> Self {
        Self {
            strategy: GroupStrategy::default(),
            max_phases: DEFAULT_MAX_PHASES,
            include_merges: false,
        }
    }
}

/// Parse a commit range (`A..B`, `A^..B`, tag ranges) into commits,
/// oldest first.
pub fn parse_range(root: &Path, range: &str) -> Result<Vec<ParsedCommit>> {
    parse_range_with(root, range, false)
}

pub fn parse_range_with(root: &Path, range: &str, include_merges: bool) -> Result<Vec<ParsedCommit>> {
    let repo = Repository::open(root).map_err(|_| SandboxError::NotARepository {
        path: root.to_path_buf(),
    })?;

    let mut walk = repo.revwalk().context("Failed to start revision walk")?;
    if range.contains("..") {
        walk.push_range(range)
            .with_context(|| format!("Invalid commit range '{}'", range))?;
    } else {
        let object = repo
            .revparse_single(range)
            .with_context(|| format!("Unknown revision '{}'", range))?;
        walk.push(object.id())
            .with_context(|| format!("Invalid revision '{}'", range))?;
    }
    walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::REVERSE)
        .context("Failed to order revision walk")?;

    let mut commits = Vec::new();
    for oid in walk {
        let oid = oid.context("Revision walk failed")?;
        let commit = repo.find_commit(oid).context("Missing commit object")?;
        if commit.parent_count() > 1 && !include_merges {
            continue;
        }
        commits.push(parse_commit(&repo, &commit)?);
    }
    Ok(commits)
}

fn parse_commit(repo: &Repository, commit: &git2::Commit<'_>) -> Result<ParsedCommit> {
    let parent_tree = commit.parent(0).ok().map(|p| p.tree()).transpose()?;
    let tree = commit.tree()?;

    let mut opts = DiffOptions::new();
    let mut diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))?;
    // Enable git's own rename detection
    let mut find = DiffFindOptions::new();
    find.renames(true);
    diff.find_similar(Some(&mut find))?;

    let mut files = Vec::new();
    for delta_idx in 0..diff.deltas().len() {
        let Some(delta) = diff.get_delta(delta_idx) else {
            continue;
        };
        let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
            continue;
        };
        let change_type = match delta.status() {
            Delta::Added => CommitChangeType::Added,
            Delta::Modified => CommitChangeType::Modified,
            Delta::Deleted => CommitChangeType::Deleted,
            Delta::Renamed => CommitChangeType::Renamed,
            _ => continue,
        };
        let old_path = if change_type == CommitChangeType::Renamed {
            delta
                .old_file()
                .path()
                .map(|p| p.to_string_lossy().to_string())
        } else {
            None
        };

        // Binary files are counted but contribute zero lines.
        let (mut insertions, mut deletions) = (0usize, 0usize);
        if let Ok(Some(patch)) = git2::Patch::from_diff(&diff, delta_idx)
            && let Ok((_, additions, removals)) = patch.line_stats()
        {
            insertions = additions;
            deletions = removals;
        }

        files.push(CommitFileChange {
            path: path.to_string_lossy().to_string(),
            change_type,
            insertions,
            deletions,
            old_path,
        });
    }

    let when = commit.time();
    let date = chrono::DateTime::from_timestamp(when.seconds(), 0)
        .map(crate::util::iso_millis)
        .unwrap_or_default();

    Ok(ParsedCommit {
        info: CommitInfo {
            hash: commit.id().to_string(),
            short_hash: commit.id().to_string()[..7].to_string(),
            author: commit.author().name().unwrap_or("unknown").to_string(),
            date,
            message: commit.message().unwrap_or("").to_string(),
        },
        files,
    })
}

/// Group parsed commits into phases.
pub fn group(commits: &[ParsedCommit], options: &ReverseOptions) -> Vec<InferredPhase> {
    let mut phases = match options.strategy {
        GroupStrategy::Commits => group_by_commit(commits),
        GroupStrategy::Directories => group_by_key(commits, |path| top_level(path).to_string()),
        GroupStrategy::Filetypes => group_by_key(commits, |path| extension_of(path).to_string()),
        GroupStrategy::Semantic => group_semantic(commits),
    };

    // The phase count never exceeds max_phases: overflow folds into the
    // final phase.
    if phases.len() > options.max_phases && options.max_phases > 0 {
        let tail: Vec<InferredPhase> = phases.split_off(options.max_phases - 1);
        let mut folded = tail[0].clone();
        for phase in &tail[1..] {
            folded.commits.extend(phase.commits.iter().cloned());
            folded.files.extend(phase.files.iter().cloned());
            folded.insertions += phase.insertions;
            folded.deletions += phase.deletions;
        }
        folded.title = format!("Remaining changes ({} groups)", tail.len());
        phases.push(folded);
    }

    for (idx, phase) in phases.iter_mut().enumerate() {
        phase.number = (idx + 1) as u32;
    }
    phases
}

/// Full pipeline: parse, group, wrap.
pub fn reverse_audit(root: &Path, range: &str, options: &ReverseOptions) -> Result<ReverseAudit> {
    let commits = parse_range_with(root, range, options.include_merges)?;
    Ok(ReverseAudit {
        range: range.to_string(),
        strategy: options.strategy,
        phases: group(&commits, options),
    })
}

fn make_phase(title: String, category: Category, commits: Vec<&ParsedCommit>) -> InferredPhase {
    let files: Vec<CommitFileChange> = commits
        .iter()
        .flat_map(|c| c.files.iter().cloned())
        .collect();
    InferredPhase {
        number: 0,
        title,
        category,
        insertions: files.iter().map(|f| f.insertions).sum(),
        deletions: files.iter().map(|f| f.deletions).sum(),
        commits: commits.into_iter().map(|c| c.info.clone()).collect(),
        files,
    }
}

fn group_by_commit(commits: &[ParsedCommit]) -> Vec<InferredPhase> {
    commits
        .iter()
        .map(|commit| {
            let category = infer_category(std::slice::from_ref(commit), &commit.files);
            make_phase(clean_subject(commit.subject()), category, vec![commit])
        })
        .collect()
}

/// Group files by a path-derived key; phases ordered by file count
/// descending (ties by key for determinism).
fn group_by_key<F>(commits: &[ParsedCommit], key_of: F) -> Vec<InferredPhase>
where
    F: Fn(&str) -> String,
{
    let mut groups: BTreeMap<String, (Vec<&ParsedCommit>, Vec<CommitFileChange>)> = BTreeMap::new();
    for commit in commits {
        for file in &commit.files {
            let key = key_of(&file.path);
            let entry = groups.entry(key).or_default();
            if !entry.0.iter().any(|c| c.info.hash == commit.info.hash) {
                entry.0.push(commit);
            }
            entry.1.push(file.clone());
        }
    }

    let mut keyed: Vec<(String, Vec<&ParsedCommit>, Vec<CommitFileChange>)> = groups
        .into_iter()
        .map(|(key, (commits, files))| (key, commits, files))
        .collect();
    keyed.sort_by(|a, b| b.2.len().cmp(&a.2.len()).then(a.0.cmp(&b.0)));

    keyed
        .into_iter()
        .map(|(key, group_commits, files)| {
            let owned: Vec<ParsedCommit> = group_commits.iter().map(|c| (*c).clone()).collect();
            let category = infer_category(&owned, &files);
            InferredPhase {
                number: 0,
                title: format!("Changes in {}", key),
                category,
                insertions: files.iter().map(|f| f.insertions).sum(),
                deletions: files.iter().map(|f| f.deletions).sum(),
                commits: owned.iter().map(|c| c.info.clone()).collect(),
                files,
            }
        })
        .collect()
}

/// Conventional-commit grouping with keyword fallback. Output order is
/// fixed: feat, fix, refactor, test, docs, chore, other.
fn group_semantic(commits: &[ParsedCommit]) -> Vec<InferredPhase> {
    let mut buckets: BTreeMap<Category, Vec<&ParsedCommit>> = BTreeMap::new();
    for commit in commits {
        let category = semantic_category(commit);
        buckets.entry(category).or_default().push(commit);
    }

    // BTreeMap over Category already iterates in the stable order.
    buckets
        .into_iter()
        .map(|(category, group_commits)| {
            let title = infer_group_title(category, &group_commits);
            make_phase(title, category, group_commits)
        })
        .collect()
}

fn semantic_category(commit: &ParsedCommit) -> Category {
    let subject = commit.subject();
    if let Some(prefix) = conventional_prefix(subject) {
        return match prefix.as_str() {
            "feat" => Category::Feature,
            "fix" => Category::Fix,
            "refactor" | "style" => Category::Refactor,
            "test" => Category::Test,
            "docs" => Category::Docs,
            "chore" => Category::Chore,
            _ => Category::Other,
        };
    }
    infer_category(std::slice::from_ref(commit), &commit.files)
}

fn conventional_prefix(subject: &str) -> Option<String> {
    let head = subject.split(':').next()?;
    if head == subject {
        return None;
    }
    let bare = head
        .split('(')
        .next()
        .unwrap_or(head)
        .trim_end_matches('!')
        .trim();
    match bare {
        "feat" | "fix" | "docs" | "style" | "refactor" | "test" | "chore" => {
            Some(bare.to_string())
        }
        _ => None,
    }
}

const FIX_KEYWORDS: &[&str] = &["fix", "bug", "patch", "hotfix", "regression", "crash"];
const CHORE_KEYWORDS: &[&str] = &["chore", "bump", "dependencies", "deps", "release"];

fn is_test_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.starts_with("test")
        || lower.contains("/test")
        || lower.contains("_test.")
        || lower.contains(".test.")
        || lower.contains("spec/")
}

fn is_docs_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.starts_with("docs/")
        || lower.ends_with(".md")
        || lower.ends_with(".rst")
        || lower.ends_with(".adoc")
}

fn is_config_path(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    matches!(
        name.as_str(),
        "cargo.toml"
            | "cargo.lock"
            | "package.json"
            | "package-lock.json"
            | "pyproject.toml"
            | "go.mod"
            | "go.sum"
            | "makefile"
    ) || name.ends_with(".lock")
        || name.ends_with(".yml")
        || name.ends_with(".yaml")
        || name.ends_with(".toml")
}

/// Category inference priority: test-only → docs-only → fix keywords →
/// chore → added-majority feature → deletion-heavy refactor → feature.
fn infer_category(commits: &[ParsedCommit], files: &[CommitFileChange]) -> Category {
    if !files.is_empty() && files.iter().all(|f| is_test_path(&f.path)) {
        return Category::Test;
    }
    if !files.is_empty() && files.iter().all(|f| is_docs_path(&f.path)) {
        return Category::Docs;
    }
    let messages_lower: Vec<String> = commits
        .iter()
        .map(|c| c.subject().to_lowercase())
        .collect();
    if messages_lower
        .iter()
        .any(|m| FIX_KEYWORDS.iter().any(|k| m.contains(k)))
    {
        return Category::Fix;
    }
    let config_only = !files.is_empty() && files.iter().all(|f| is_config_path(&f.path));
    if config_only
        || messages_lower
            .iter()
            .any(|m| CHORE_KEYWORDS.iter().any(|k| m.contains(k)))
    {
        return Category::Chore;
    }
    let added = files
        .iter()
        .filter(|f| f.change_type == CommitChangeType::Added)
        .count();
    let deleted = files
        .iter()
        .filter(|f| f.change_type == CommitChangeType::Deleted)
        .count();
    if !files.is_empty() && added * 2 > files.len() {
        return Category::Feature;
    }
    if !files.is_empty() && deleted * 2 >= files.len() {
        return Category::Refactor;
    }
    Category::Feature
}

/// Title of a single commit: conventional prefix stripped, first letter
/// capitalized.
fn clean_subject(subject: &str) -> String {
    let without_prefix = match subject.split_once(':') {
        Some((_, rest)) if conventional_prefix(subject).is_some() => rest.trim(),
        _ => subject.trim(),
    };
    let mut chars = without_prefix.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "into", "that", "this", "when", "where", "some", "more",
    "add", "adds", "added", "update", "updated", "remove", "removed",
];

/// Title of a multi-commit group: category prefix plus the most frequent
/// meaningful words across subjects.
fn infer_group_title(category: Category, commits: &[&ParsedCommit]) -> String {
    if commits.len() == 1 {
        return clean_subject(commits[0].subject());
    }
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for commit in commits {
        for word in clean_subject(commit.subject())
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
        {
            if word.len() > 3 && !STOPWORDS.contains(&word) {
                *counts.entry(word.to_string()).or_default() += 1;
            }
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let words: Vec<String> = ranked.into_iter().take(3).map(|(w, _)| w).collect();

    let mut title = capitalize(category.as_str());
    if !words.is_empty() {
        title.push_str(": ");
        title.push_str(&words.join(" "));
    } else {
        title.push_str(&format!(": {} commits", commits.len()));
    }
    title
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn top_level(path: &str) -> &str {
    match path.split_once('/') {
        Some((dir, _)) => dir,
        None => "(root)",
    }
}

fn extension_of(path: &str) -> &str {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("(none)")
}

/// Render the inferred audit as a Markdown document.
pub fn to_markdown(audit: &ReverseAudit) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Reverse Audit: {}\n\n", audit.range));
    out.push_str(&format!(
        "Inferred from {} phase group(s) using the {:?} strategy.\n\n",
        audit.phases.len(),
        audit.strategy
    ));

    for phase in &audit.phases {
        out.push_str(&format!("## Phase {}: {}\n\n", phase.number, phase.title));
        out.push_str("### Context\n\n");
        out.push_str(&format!(
            "Category: {}. {} commit(s), +{}/-{} lines.\n\n",
            phase.category.as_str(),
            phase.commits.len(),
            phase.insertions,
            phase.deletions
        ));
        out.push_str("### Goal\n\n");
        out.push_str(&format!("Reproduce the {} changes of this group.\n\n", phase.category.as_str()));
        out.push_str("### Files\n\n");
        for file in &phase.files {
            let action = match file.change_type {
                CommitChangeType::Added => "Create",
                CommitChangeType::Modified => "Modify",
                CommitChangeType::Deleted => "Delete",
                CommitChangeType::Renamed => "Rename",
            };
            match &file.old_path {
                Some(old) => out.push_str(&format!("- {} `{}` to `{}`\n", action, old, file.path)),
                None => out.push_str(&format!(
                    "- {} `{}` - +{}/-{}\n",
                    action, file.path, file.insertions, file.deletions
                )),
            }
        }
        out.push('\n');
        out.push_str("### Plan\n\n");
        for commit in &phase.commits {
            out.push_str(&format!(
                "- {} {}\n",
                commit.short_hash,
                commit.message.lines().next().unwrap_or("")
            ));
        }
        out.push('\n');
    }
    out
}
