//! Verification-step execution.
//!
//! Each verification step of a phase is a shell command. Steps run under
//! a deadline; stdout and stderr are captured and truncated before they
//! land in event payloads.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Outcome of one verification command.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationOutcome {
    pub command: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    /// Combined stdout + stderr, truncated to 1000 chars.
    pub output: String,
    pub passed: bool,
}

/// Strip the Markdown backticks a verification bullet usually carries.
pub fn command_of_step(step: &str) -> String {
    step.trim().trim_matches('`').trim().to_string()
}

/// Run one verification command in `cwd` with a deadline. A timed-out
/// command counts as failed with exit code -1.
pub async fn run_step(step: &str, cwd: &Path, deadline: Duration) -> Result<VerificationOutcome> {
    let command = command_of_step(step);
    let started = Instant::now();

    let child = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn verification command: {}", command))?;

    let outcome = match timeout(deadline, child.wait_with_output()).await {
        Ok(result) => {
            let output = result.context("Failed to wait for verification command")?;
            let exit_code = output.status.code().unwrap_or(-1);
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            if !output.stderr.is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
            }
            VerificationOutcome {
                command,
                exit_code,
                duration_ms: started.elapsed().as_millis() as u64,
                output: crate::util::truncate_output(&combined, 1000),
                passed: exit_code == 0,
            }
        }
        Err(_) => VerificationOutcome {
            command: command.clone(),
            exit_code: -1,
            duration_ms: deadline.as_millis() as u64,
            output: format!("(timed out after {}s)", deadline.as_secs()),
            passed: false,
        },
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_command_of_step_strips_backticks() {
        assert_eq!(command_of_step("`cargo test`"), "cargo test");
        assert_eq!(command_of_step("  cargo check "), "cargo check");
    }

    #[tokio::test]
    async fn test_run_step_success() {
        let dir = tempdir().unwrap();
        let outcome = run_step("`true`", dir.path(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.command, "true");
    }

    #[tokio::test]
    async fn test_run_step_failure_captures_output() {
        let dir = tempdir().unwrap();
        let outcome = run_step("echo boom >&2; exit 4", dir.path(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.exit_code, 4);
        assert!(outcome.output.contains("boom"));
    }

    #[tokio::test]
    async fn test_run_step_runs_in_cwd() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "found").unwrap();
        let outcome = run_step("cat marker.txt", dir.path(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(outcome.passed);
        assert!(outcome.output.contains("found"));
    }

    #[tokio::test]
    async fn test_run_step_timeout() {
        let dir = tempdir().unwrap();
        let outcome = run_step("sleep 5", dir.path(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.output.contains("timed out"));
    }
}
