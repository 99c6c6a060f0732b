//! Typed error hierarchy for Phaser.
//!
//! Four top-level enums cover the subsystems with contractual failure modes:
//! - `StoreError` — persistence and lock failures under `.phaser/`
//! - `SandboxError` — simulation and branch-mode failures
//! - `EnforceError` — hook input failures (these alone map to exit code 3)
//! - `ReportError` — execution-report and audit-document validation failures
//!
//! Policy decisions (allow/deny/warn) are never errors; they are ordinary
//! values reported on stdout with exit code 0.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read {}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store file {}: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error("Lock contention on {} exhausted after {attempts} attempts", path.display())]
    LockContention { path: PathBuf, attempts: u32 },

    #[error("No home directory available for global storage")]
    NoHomeDir,
}

/// Errors from the simulation and branch-mode sandboxes.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{} is not a git repository", path.display())]
    NotARepository { path: PathBuf },

    #[error("A simulation is already active for this root (context at {})", context_path.display())]
    SimulationActive { context_path: PathBuf },

    #[error("Branch mode is already active for this root (context at {})", context_path.display())]
    BranchModeActive { context_path: PathBuf },

    #[error("Working tree has uncommitted changes; commit or stash them first")]
    DirtyWorkingTree,

    #[error("HEAD is detached; check out a branch first")]
    DetachedHead,

    #[error("Merge conflict in {branch}; conflicting paths: {}", paths.join(", "))]
    MergeConflict { branch: String, paths: Vec<String> },

    #[error("Rollback incomplete; could not restore: {}", paths.join(", "))]
    RollbackIncomplete { paths: Vec<String> },

    #[error(transparent)]
    Git(#[from] git2::Error),
}

/// Errors from the enforcement hook's input handling.
///
/// Every variant here maps to exit code 3; anything the Enforcer can
/// decide on (including skips) is a decision, not an error.
#[derive(Debug, Error)]
pub enum EnforceError {
    #[error("Failed to read stdin: {0}")]
    StdinRead(#[source] std::io::Error),

    #[error("stdin exceeds the {limit} byte limit")]
    StdinTooLarge { limit: usize },

    #[error("Malformed hook input: {0}")]
    MalformedInput(String),

    #[error("file_path contains a parent-directory component: {path}")]
    PathTraversal { path: String },
}

/// Validation errors for audit documents and execution reports.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Missing required section '{section}'")]
    MissingSection { section: String },

    #[error("Malformed {what} at line {line}: {message}")]
    Malformed {
        what: String,
        line: usize,
        message: String,
    },
}

/// Exit-code classes for the CLI.
///
/// 0 success or policy decision, 1 expected failure, 2 usage error
/// (produced by clap), 3 enforcer input/internal error.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<EnforceError>().is_some() {
        3
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_lock_contention_carries_path() {
        let err = StoreError::LockContention {
            path: PathBuf::from("/p/.phaser/events.json"),
            attempts: 3,
        };
        assert!(err.to_string().contains("events.json"));
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn sandbox_error_merge_conflict_lists_paths() {
        let err = SandboxError::MergeConflict {
            branch: "audit/x/phase-01-a".to_string(),
            paths: vec!["src/a.rs".to_string(), "src/b.rs".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("src/a.rs, src/b.rs"));
    }

    #[test]
    fn enforce_errors_map_to_exit_3() {
        let err: anyhow::Error = EnforceError::MalformedInput("not json".to_string()).into();
        assert_eq!(exit_code(&err), 3);
    }

    #[test]
    fn other_errors_map_to_exit_1() {
        let err: anyhow::Error = StoreError::NoHomeDir.into();
        assert_eq!(exit_code(&err), 1);
        let plain = anyhow::anyhow!("something expected went wrong");
        assert_eq!(exit_code(&plain), 1);
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::NoHomeDir);
        assert_std_error(&SandboxError::DirtyWorkingTree);
        assert_std_error(&EnforceError::StdinTooLarge { limit: 10 });
        assert_std_error(&ReportError::MissingSection {
            section: "Metadata".to_string(),
        });
    }
}
