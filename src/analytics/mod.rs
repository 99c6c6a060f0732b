//! Post-execution analytics.
//!
//! Execution reports (the Markdown artifact emitted after an audit run)
//! are parsed into per-run records, stored one JSON file per execution
//! with a per-project index, and queried with filter + aggregation
//! semantics. The computed duration (from the two timestamps) is
//! authoritative; a parsed duration value is only an advisory fallback.

use crate::errors::ReportError;
use crate::store::Store;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Partial,
    Failed,
}

impl std::str::FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(ExecutionStatus::Success),
            "partial" => Ok(ExecutionStatus::Partial),
            "failed" => Ok(ExecutionStatus::Failed),
            _ => anyhow::bail!("Invalid status '{}'. Valid values: success, partial, failed", s),
        }
    }
}

/// One phase row of the execution summary table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub number: u32,
    pub title: String,
    /// Parsed from the status symbol: ✅ completed, ⚠️ partial, ❌ failed.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// One imported execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub schema_version: String,
    pub execution_id: Uuid,
    pub audit_document: String,
    pub document_title: String,
    pub project_name: String,
    pub project_path: String,
    pub branch: String,
    pub started_at: String,
    pub completed_at: String,
    pub phaser_version: String,
    pub status: ExecutionStatus,
    pub phases_planned: usize,
    pub phases_completed: usize,
    pub baseline_tests: i64,
    pub final_tests: i64,
    pub base_commit: String,
    pub final_commit: String,
    pub commit_count: usize,
    pub files_changed: usize,
    pub phases: Vec<PhaseRecord>,
    pub report_path: String,
    pub imported_at: String,
    /// Unknown metadata rows, preserved as written.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ExecutionRecord {
    pub fn test_delta(&self) -> i64 {
        self.final_tests - self.baseline_tests
    }

    /// Duration computed from the timestamps; falls back to a parsed
    /// `Duration` metadata row in seconds.
    pub fn duration_seconds(&self) -> Option<i64> {
        let started = DateTime::parse_from_rfc3339(&self.started_at).ok();
        let completed = DateTime::parse_from_rfc3339(&self.completed_at).ok();
        match (started, completed) {
            (Some(s), Some(c)) => Some((c - s).num_seconds()),
            _ => self
                .metadata
                .get("Duration")
                .and_then(|v| v.trim_end_matches('s').trim().parse().ok()),
        }
    }
}

/// Parse an execution report. Section problems carry the offending line.
pub fn parse_report(content: &str, report_path: &str) -> Result<ExecutionRecord, ReportError> {
    let lines: Vec<&str> = content.lines().collect();

    let metadata = parse_metadata_section(&lines)?;
    let phases = parse_phase_table(&lines)?;
    let (baseline_tests, final_tests) = parse_test_results(&lines)?;

    let get = |key: &str| metadata.get(key).cloned().unwrap_or_default();
    let status: ExecutionStatus = get("Status")
        .parse()
        .map_err(|_| ReportError::Malformed {
            what: "status".to_string(),
            line: 0,
            message: format!("unknown status '{}'", get("Status")),
        })?;

    let known_keys = [
        "Audit Document",
        "Title",
        "Project",
        "Project Path",
        "Branch",
        "Started",
        "Completed",
        "Phaser Version",
        "Status",
        "Base Commit",
        "Final Commit",
        "Commits",
        "Files Changed",
    ];
    let extra: BTreeMap<String, String> = metadata
        .iter()
        .filter(|(k, _)| !known_keys.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let phases_completed = phases.iter().filter(|p| p.status == "completed").count();

    Ok(ExecutionRecord {
        schema_version: SCHEMA_VERSION.to_string(),
        execution_id: Uuid::new_v4(),
        audit_document: get("Audit Document"),
        document_title: get("Title"),
        project_name: get("Project"),
        project_path: get("Project Path"),
        branch: get("Branch"),
        started_at: get("Started"),
        completed_at: get("Completed"),
        phaser_version: get("Phaser Version"),
        status,
        phases_planned: phases.len(),
        phases_completed,
        baseline_tests,
        final_tests,
        base_commit: get("Base Commit"),
        final_commit: get("Final Commit"),
        commit_count: get("Commits").parse().unwrap_or(0),
        files_changed: get("Files Changed").parse().unwrap_or(0),
        phases,
        report_path: report_path.to_string(),
        imported_at: crate::util::now_iso(),
        metadata: extra,
    })
}

fn section_start(lines: &[&str], heading: &str) -> Option<usize> {
    lines
        .iter()
        .position(|l| l.trim().eq_ignore_ascii_case(heading))
}

fn parse_metadata_section(lines: &[&str]) -> Result<BTreeMap<String, String>, ReportError> {
    let start = section_start(lines, "## Metadata").ok_or(ReportError::MissingSection {
        section: "Metadata".to_string(),
    })?;
    let mut metadata = BTreeMap::new();
    for (offset, line) in lines[start + 1..].iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("##") {
            break;
        }
        if !trimmed.starts_with('|') {
            continue;
        }
        let cells: Vec<&str> = trimmed.trim_matches('|').split('|').map(str::trim).collect();
        if cells.len() < 2 {
            return Err(ReportError::Malformed {
                what: "metadata row".to_string(),
                line: start + 2 + offset,
                message: "expected | key | value |".to_string(),
            });
        }
        // Skip the header separator row
        if cells[0].chars().all(|c| c == '-' || c.is_whitespace()) {
            continue;
        }
        if cells[0].eq_ignore_ascii_case("key") {
            continue;
        }
        metadata.insert(cells[0].to_string(), cells[1].to_string());
    }
    Ok(metadata)
}

fn parse_phase_table(lines: &[&str]) -> Result<Vec<PhaseRecord>, ReportError> {
    let start =
        section_start(lines, "## Execution Summary").ok_or(ReportError::MissingSection {
            section: "Execution Summary".to_string(),
        })?;
    let mut phases = Vec::new();
    for (offset, line) in lines[start + 1..].iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("##") {
            break;
        }
        if !trimmed.starts_with('|') {
            continue;
        }
        let cells: Vec<&str> = trimmed.trim_matches('|').split('|').map(str::trim).collect();
        if cells[0].chars().all(|c| c == '-' || c.is_whitespace()) || cells[0] == "#" {
            continue;
        }
        if cells.len() < 3 {
            return Err(ReportError::Malformed {
                what: "phase row".to_string(),
                line: start + 2 + offset,
                message: "expected | # | title | status | commit |".to_string(),
            });
        }
        let number: u32 = cells[0].parse().map_err(|_| ReportError::Malformed {
            what: "phase number".to_string(),
            line: start + 2 + offset,
            message: format!("'{}' is not a number", cells[0]),
        })?;
        let status = match cells[2] {
            "✅" => "completed",
            "⚠️" => "partial",
            "❌" => "failed",
            other => {
                return Err(ReportError::Malformed {
                    what: "phase status".to_string(),
                    line: start + 2 + offset,
                    message: format!("unknown status symbol '{}'", other),
                });
            }
        };
        phases.push(PhaseRecord {
            number,
            title: cells[1].to_string(),
            status: status.to_string(),
            commit: cells
                .get(3)
                .filter(|c| !c.is_empty())
                .map(|c| c.to_string()),
        });
    }
    Ok(phases)
}

fn parse_test_results(lines: &[&str]) -> Result<(i64, i64), ReportError> {
    let start = section_start(lines, "## Test Results").ok_or(ReportError::MissingSection {
        section: "Test Results".to_string(),
    })?;
    let mut baseline = None;
    let mut final_count = None;
    for (offset, line) in lines[start + 1..].iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("##") {
            break;
        }
        for (marker, slot) in [
            ("**Baseline:**", &mut baseline),
            ("**Final:**", &mut final_count),
        ] {
            if let Some(rest) = trimmed.strip_prefix(marker) {
                let value: i64 = rest.trim().parse().map_err(|_| ReportError::Malformed {
                    what: "test count".to_string(),
                    line: start + 2 + offset,
                    message: format!("'{}' is not a number", rest.trim()),
                })?;
                *slot = Some(value);
            }
        }
    }
    match (baseline, final_count) {
        (Some(b), Some(f)) => Ok((b, f)),
        _ => Err(ReportError::MissingSection {
            section: "Test Results baseline/final counts".to_string(),
        }),
    }
}

/// Query filters over stored executions.
#[derive(Debug, Clone, Default)]
pub struct AnalyticsQuery {
    pub limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub status: Option<ExecutionStatus>,
    pub document: Option<String>,
}

impl AnalyticsQuery {
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        if let Some(status) = self.status
            && record.status != status
        {
            return false;
        }
        if let Some(document) = &self.document
            && !record.audit_document.contains(document.as_str())
            && !record.document_title.contains(document.as_str())
        {
            return false;
        }
        if let Some(since) = self.since
            && record.started_at < crate::util::iso_millis(since)
        {
            return false;
        }
        if let Some(until) = self.until
            && record.started_at > crate::util::iso_millis(until)
        {
            return false;
        }
        true
    }
}

/// Aggregate statistics over a set of executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregation {
    pub total: usize,
    pub successful: usize,
    pub partial: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub duration_min_secs: i64,
    pub duration_avg_secs: f64,
    pub duration_max_secs: i64,
    pub duration_total_secs: i64,
    pub total_test_delta: i64,
    pub avg_test_delta: f64,
    pub phases_executed: usize,
    pub phases_completed: usize,
    pub phase_success_rate: f64,
    pub earliest: Option<String>,
    pub latest: Option<String>,
}

pub fn aggregate(records: &[ExecutionRecord]) -> Aggregation {
    if records.is_empty() {
        return Aggregation::default();
    }
    let durations: Vec<i64> = records.iter().filter_map(|r| r.duration_seconds()).collect();
    let successful = records
        .iter()
        .filter(|r| r.status == ExecutionStatus::Success)
        .count();
    let partial = records
        .iter()
        .filter(|r| r.status == ExecutionStatus::Partial)
        .count();
    let failed = records
        .iter()
        .filter(|r| r.status == ExecutionStatus::Failed)
        .count();
    let phases_executed: usize = records.iter().map(|r| r.phases_planned).sum();
    let phases_completed: usize = records.iter().map(|r| r.phases_completed).sum();
    let total_test_delta: i64 = records.iter().map(|r| r.test_delta()).sum();

    Aggregation {
        total: records.len(),
        successful,
        partial,
        failed,
        success_rate: successful as f64 / records.len() as f64,
        duration_min_secs: durations.iter().copied().min().unwrap_or(0),
        duration_avg_secs: if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<i64>() as f64 / durations.len() as f64
        },
        duration_max_secs: durations.iter().copied().max().unwrap_or(0),
        duration_total_secs: durations.iter().sum(),
        total_test_delta,
        avg_test_delta: total_test_delta as f64 / records.len() as f64,
        phases_executed,
        phases_completed,
        phase_success_rate: if phases_executed == 0 {
            0.0
        } else {
            phases_completed as f64 / phases_executed as f64
        },
        earliest: records.iter().map(|r| r.started_at.clone()).min(),
        latest: records.iter().map(|r| r.started_at.clone()).max(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    execution_id: Uuid,
    file: String,
    status: ExecutionStatus,
    started_at: String,
    document_title: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AnalyticsIndex {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    executions: Vec<IndexEntry>,
}

/// One project row in the global registry (`~/.phaser/projects.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub name: String,
    pub path: String,
    pub last_import: String,
}

pub struct Analytics {
    store: Store,
    /// Global project registry; `None` disables registration.
    registry_path: Option<PathBuf>,
}

impl Analytics {
    pub fn new(store: Store) -> Self {
        let registry_path = dirs::home_dir().map(|h| h.join(".phaser").join("projects.json"));
        Self {
            store,
            registry_path,
        }
    }

    pub fn with_registry(store: Store, registry_path: Option<PathBuf>) -> Self {
        Self {
            store,
            registry_path,
        }
    }

    /// Import one report file: parse, store the record, update the
    /// index and the global registry.
    pub fn import(&self, report_path: &Path) -> Result<ExecutionRecord> {
        let content = std::fs::read_to_string(report_path)
            .with_context(|| format!("Failed to read report {}", report_path.display()))?;
        let record = parse_report(&content, &report_path.to_string_lossy())?;

        let file_name = format!(
            "{}-{}.json",
            record.started_at.replace(':', "-"),
            &record.execution_id.to_string()[..8]
        );
        let dir = self.store.executions_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let json = serde_json::to_string_pretty(&record).context("Failed to serialize record")?;
        crate::store::lock::write_locked(&dir.join(&file_name), &json)?;

        self.rebuild_index()?;
        if let Err(e) = self.register_project(&record) {
            tracing::warn!("failed to update project registry: {:#}", e);
        }
        Ok(record)
    }

    /// All stored executions, newest first.
    pub fn list(&self, query: &AnalyticsQuery) -> Result<Vec<ExecutionRecord>> {
        let dir = self.store.executions_dir();
        let mut records = Vec::new();
        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let record: ExecutionRecord = serde_json::from_str(&content)
                    .with_context(|| format!("Corrupt execution record {}", path.display()))?;
                if query.matches(&record) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Delete one execution and rebuild the index. Returns false for an
    /// unknown id.
    pub fn delete(&self, execution_id: Uuid) -> Result<bool> {
        let dir = self.store.executions_dir();
        if !dir.exists() {
            return Ok(false);
        }
        let suffix = format!("{}.json", &execution_id.to_string()[..8]);
        let mut deleted = false;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(&suffix))
                .unwrap_or(false)
            {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                deleted = true;
            }
        }
        if deleted {
            self.rebuild_index()?;
        }
        Ok(deleted)
    }

    /// Remove every stored execution. Returns the count removed.
    pub fn clear(&self) -> Result<usize> {
        let records = self.list(&AnalyticsQuery::default())?;
        let count = records.len();
        let dir = self.store.executions_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to clear {}", dir.display()))?;
        }
        self.rebuild_index()?;
        Ok(count)
    }

    fn rebuild_index(&self) -> Result<()> {
        let records = self.list(&AnalyticsQuery::default())?;
        let index = AnalyticsIndex {
            version: 1,
            executions: records
                .iter()
                .map(|r| IndexEntry {
                    execution_id: r.execution_id,
                    file: format!(
                        "executions/{}-{}.json",
                        r.started_at.replace(':', "-"),
                        &r.execution_id.to_string()[..8]
                    ),
                    status: r.status,
                    started_at: r.started_at.clone(),
                    document_title: r.document_title.clone(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&index).context("Failed to serialize index")?;
        crate::store::lock::write_locked(&self.store.analytics_index(), &json)?;
        Ok(())
    }

    fn register_project(&self, record: &ExecutionRecord) -> Result<()> {
        let Some(registry_path) = &self.registry_path else {
            return Ok(());
        };
        let mut projects: Vec<ProjectEntry> = match std::fs::read_to_string(registry_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        match projects.iter_mut().find(|p| p.path == record.project_path) {
            Some(entry) => entry.last_import = crate::util::now_iso(),
            None => projects.push(ProjectEntry {
                name: record.project_name.clone(),
                path: record.project_path.clone(),
                last_import: crate::util::now_iso(),
            }),
        }
        let json = serde_json::to_string_pretty(&projects).context("Failed to serialize registry")?;
        crate::store::lock::write_locked(registry_path, &json)?;
        Ok(())
    }
}
