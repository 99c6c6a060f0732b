//! Audit and phase domain types.
//!
//! An audit is the parsed, executable form of one Markdown audit document:
//! an ordered list of phases, each with file-change intents, a plan,
//! verification steps and acceptance criteria. The parser builds these,
//! the phase engine mutates status and counters, and the negotiation
//! engine rewrites the phase list. Nothing else touches them.

pub mod parser;

pub use parser::{AuditParser, ParsedAudit};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    /// Completed with at least one failed phase and fail-fast off.
    Partial,
    Abandoned,
}

impl AuditStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuditStatus::Completed | AuditStatus::Partial | AuditStatus::Abandoned
        )
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditStatus::Pending => "pending",
            AuditStatus::InProgress => "in_progress",
            AuditStatus::Completed => "completed",
            AuditStatus::Partial => "partial",
            AuditStatus::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

/// Per-phase execution state. The Markdown checkbox form is the durable
/// rendering: `[ ]`, `[x]`, `[FAILED]`, `[SKIPPED]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn marker(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "[ ]",
            PhaseStatus::Executing => "[~]",
            PhaseStatus::Completed => "[x]",
            PhaseStatus::Failed => "[FAILED]",
            PhaseStatus::Skipped => "[SKIPPED]",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Completed | PhaseStatus::Failed | PhaseStatus::Skipped
        )
    }
}

/// The advisory action a phase intends for one file. The engine tracks
/// what actually changed via manifests; this only guides the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
    Rename,
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileAction::Create => "create",
            FileAction::Modify => "modify",
            FileAction::Delete => "delete",
            FileAction::Rename => "rename",
        }
    }
}

impl std::str::FromStr for FileAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(FileAction::Create),
            "modify" => Ok(FileAction::Modify),
            "delete" => Ok(FileAction::Delete),
            "rename" => Ok(FileAction::Rename),
            _ => anyhow::bail!(
                "Invalid file action '{}'. Valid values: create, modify, delete, rename",
                s
            ),
        }
    }
}

/// One intended file change within a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChangeIntent {
    pub path: String,
    pub action: FileAction,
    #[serde(default)]
    pub description: String,
    /// Source path for renames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
}

/// An ordered unit of work within an audit.
///
/// The stable `id` (`phase-3`, or `phase-3a` after a split) is never
/// reused. `split_from` / `merged_from` are set by the negotiation
/// operation that created the phase and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub number: u32,
    pub title: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub files: Vec<FileChangeIntent>,
    #[serde(default)]
    pub plan: Vec<String>,
    #[serde(default)]
    pub verification: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub rollback: Vec<String>,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_from: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parse_warnings: Vec<String>,
}

impl Phase {
    pub fn new(number: u32, title: impl Into<String>) -> Self {
        Self {
            id: format!("phase-{}", number),
            number,
            title: title.into(),
            context: String::new(),
            goal: String::new(),
            files: Vec::new(),
            plan: Vec::new(),
            verification: Vec::new(),
            acceptance_criteria: Vec::new(),
            rollback: Vec::new(),
            status: PhaseStatus::Pending,
            split_from: None,
            merged_from: Vec::new(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            parse_warnings: Vec::new(),
        }
    }

    /// Slug of the phase title, for branch names and phase files.
    pub fn slug(&self) -> String {
        crate::util::slugify(&self.title)
    }
}

/// File-change counters accumulated over an audit run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounters {
    #[serde(default)]
    pub files_created: u64,
    #[serde(default)]
    pub files_modified: u64,
    #[serde(default)]
    pub files_deleted: u64,
}

/// The durable record of one audit, persisted in `audits.json`.
///
/// Unknown fields written by future versions round-trip through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub source_file: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub status: AuditStatus,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub counters: ChangeCounters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AuditRecord {
    pub fn new(title: impl Into<String>, source_file: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: Uuid::new_v4(),
            slug: crate::util::slugify(&title),
            title,
            source_file: source_file.into(),
            project: None,
            status: AuditStatus::Pending,
            started_at: crate::util::now_iso(),
            completed_at: None,
            phases: Vec::new(),
            counters: ChangeCounters::default(),
            warnings: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn phases_completed(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
            .count()
    }

    pub fn phases_skipped(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Skipped)
            .count()
    }

    pub fn phases_failed(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Failed)
            .count()
    }
}
