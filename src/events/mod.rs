//! Typed lifecycle events.
//!
//! Events are immutable records of everything that happens to an audit:
//! lifecycle transitions, verification outcomes, and tracked file changes.
//! The set of types is closed; adding one means extending [`EventType`]
//! and every match over it.

pub mod bus;

pub use bus::EventBus;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// The closed set of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AuditStarted,
    AuditCompleted,
    AuditAbandoned,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    PhaseSkipped,
    VerificationPassed,
    VerificationFailed,
    FileCreated,
    FileModified,
    FileDeleted,
}

impl EventType {
    /// Returns all known event types.
    pub fn all() -> &'static [EventType] {
        &[
            EventType::AuditStarted,
            EventType::AuditCompleted,
            EventType::AuditAbandoned,
            EventType::PhaseStarted,
            EventType::PhaseCompleted,
            EventType::PhaseFailed,
            EventType::PhaseSkipped,
            EventType::VerificationPassed,
            EventType::VerificationFailed,
            EventType::FileCreated,
            EventType::FileModified,
            EventType::FileDeleted,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AuditStarted => "audit_started",
            EventType::AuditCompleted => "audit_completed",
            EventType::AuditAbandoned => "audit_abandoned",
            EventType::PhaseStarted => "phase_started",
            EventType::PhaseCompleted => "phase_completed",
            EventType::PhaseFailed => "phase_failed",
            EventType::PhaseSkipped => "phase_skipped",
            EventType::VerificationPassed => "verification_passed",
            EventType::VerificationFailed => "verification_failed",
            EventType::FileCreated => "file_created",
            EventType::FileModified => "file_modified",
            EventType::FileDeleted => "file_deleted",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::all()
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Unknown event type '{}'", s))
    }
}

/// One immutable lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// ISO-8601 with millisecond precision, UTC.
    pub timestamp: String,
    pub audit_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<u32>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        audit_id: Uuid,
        phase: Option<u32>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: crate::util::now_iso(),
            audit_id,
            phase,
            data,
        }
    }
}

/// Payload for `verification_passed` / `verification_failed`.
pub fn verification_payload(
    command: &str,
    exit_code: i32,
    duration_ms: u64,
    output: &str,
) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("command".to_string(), json!(command));
    data.insert("exit_code".to_string(), json!(exit_code));
    data.insert("duration_ms".to_string(), json!(duration_ms));
    data.insert(
        "output".to_string(),
        json!(crate::util::truncate_output(output, 1000)),
    );
    data
}

/// Payload for `phase_completed`.
pub fn phase_completed_payload(
    duration_ms: u64,
    files_created: u64,
    files_modified: u64,
    files_deleted: u64,
) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("duration_ms".to_string(), json!(duration_ms));
    data.insert("files_created".to_string(), json!(files_created));
    data.insert("files_modified".to_string(), json!(files_modified));
    data.insert("files_deleted".to_string(), json!(files_deleted));
    data
}

/// Payload for `audit_completed`.
pub fn audit_completed_payload(
    duration_ms: u64,
    phases_completed: usize,
    phases_skipped: usize,
    counters: &crate::audit::ChangeCounters,
) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("duration_ms".to_string(), json!(duration_ms));
    data.insert("phases_completed".to_string(), json!(phases_completed));
    data.insert("phases_skipped".to_string(), json!(phases_skipped));
    data.insert("files_created".to_string(), json!(counters.files_created));
    data.insert("files_modified".to_string(), json!(counters.files_modified));
    data.insert("files_deleted".to_string(), json!(counters.files_deleted));
    data
}

/// Payload for `file_created` / `file_modified` / `file_deleted`.
pub fn file_event_payload(path: &str) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("path".to_string(), json!(path));
    data
}
