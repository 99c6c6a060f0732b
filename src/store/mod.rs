//! Durable persistence under `.phaser/`.
//!
//! The store owns every file Phaser writes: audit records, the event log,
//! configuration, contracts, manifests, sandbox contexts, negotiation
//! sessions, analytics records, and replay history. All mutations are
//! atomic (write-to-temp-then-rename) and lock-guarded; see [`lock`].
//!
//! Location resolution, in order:
//! 1. `PHASER_STORAGE_DIR` environment override
//! 2. a `.phaser/` directory at the working directory or any ancestor
//! 3. the global `~/.phaser/`

pub mod lock;
pub mod migrate;

use crate::audit::{AuditRecord, AuditStatus};
use crate::config::PhaserConfig;
use crate::errors::StoreError;
use crate::events::{Event, EventType};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const STORAGE_DIR_ENV: &str = "PHASER_STORAGE_DIR";
pub const STORE_DIR_NAME: &str = ".phaser";

/// Resolve the store root for a working directory.
pub fn resolve_store_root(cwd: &Path) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(STORAGE_DIR_ENV)
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    let mut current = Some(cwd);
    while let Some(dir) = current {
        let candidate = dir.join(STORE_DIR_NAME);
        if candidate.is_dir() {
            return Ok(candidate);
        }
        current = dir.parent();
    }
    let home = dirs::home_dir().ok_or(StoreError::NoHomeDir)?;
    Ok(home.join(STORE_DIR_NAME))
}

/// Filters for [`Store::get_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub audit_id: Option<Uuid>,
    pub event_type: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
}

/// One entry in the replay history (`replays.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub audit_id: Uuid,
    pub slug: String,
    pub timestamp: String,
    pub scope: String,
    #[serde(default)]
    pub regressions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuditsFile {
    version: u32,
    #[serde(default)]
    audits: Vec<AuditRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EventsFile {
    version: u32,
    #[serde(default)]
    events: Vec<Event>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReplaysFile {
    version: u32,
    #[serde(default)]
    replays: Vec<ReplayRecord>,
}

/// Handle to one `.phaser/` directory. Cheap to clone; every component
/// receives its store handle explicitly.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (and lazily create) the store for a working directory.
    pub fn open(cwd: &Path) -> Result<Self> {
        let root = resolve_store_root(cwd)?;
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create store root {}", root.display()))?;
        Ok(Self { root })
    }

    /// Open a store at an explicit root (tests, `PHASER_STORAGE_DIR` users).
    pub fn at(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create store root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // Layout

    pub fn audits_file(&self) -> PathBuf {
        self.root.join("audits.json")
    }

    pub fn events_file(&self) -> PathBuf {
        self.root.join("events.json")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn contracts_dir(&self) -> PathBuf {
        self.root.join("contracts")
    }

    pub fn manifests_dir(&self, audit_id: Uuid) -> PathBuf {
        self.root.join("manifests").join(audit_id.to_string())
    }

    pub fn simulation_file(&self) -> PathBuf {
        self.root.join("simulation.yaml")
    }

    pub fn branches_file(&self) -> PathBuf {
        self.root.join("branches.yaml")
    }

    pub fn negotiate_dir(&self) -> PathBuf {
        self.root.join("negotiate")
    }

    pub fn analytics_dir(&self) -> PathBuf {
        self.root.join("analytics")
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.analytics_dir().join("executions")
    }

    pub fn analytics_index(&self) -> PathBuf {
        self.analytics_dir().join("index.json")
    }

    pub fn replays_file(&self) -> PathBuf {
        self.root.join("replays.json")
    }

    pub fn phases_dir(&self) -> PathBuf {
        self.root.join("phases")
    }

    // Audits

    fn load_audits(content: Option<&str>, path: &Path) -> Result<AuditsFile, StoreError> {
        let Some(content) = content else {
            return Ok(AuditsFile {
                version: migrate::CURRENT_VERSION,
                audits: Vec::new(),
            });
        };
        let raw: Value = serde_json::from_str(content).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let (upgraded, _) = migrate::upgrade(migrate::FileKind::Audits, raw);
        serde_json::from_value(upgraded).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn serialize_json<T: Serialize>(value: &T, path: &Path) -> Result<String, StoreError> {
        serde_json::to_string_pretty(value).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Append a new audit record; returns its ID.
    pub fn save_audit(&self, record: &AuditRecord) -> Result<Uuid> {
        let path = self.audits_file();
        let record = record.clone();
        let id = record.id;
        lock::update_locked(&path, |current| {
            let mut file = Self::load_audits(current, &path)?;
            file.audits.push(record);
            let content = Self::serialize_json(&file, &path)?;
            Ok((Some(content), ()))
        })?;
        Ok(id)
    }

    pub fn get_audit(&self, id: Uuid) -> Result<Option<AuditRecord>> {
        let path = self.audits_file();
        let content = lock::read_locked(&path)?;
        let file = Self::load_audits(content.as_deref(), &path)?;
        Ok(file.audits.into_iter().find(|a| a.id == id))
    }

    /// Find an audit by slug; the most recently started wins.
    pub fn find_audit_by_slug(&self, slug: &str) -> Result<Option<AuditRecord>> {
        let mut audits = self.list_audits(None)?;
        audits.retain(|a| a.slug == slug);
        Ok(audits.into_iter().next())
    }

    /// All audits, optionally filtered by project, sorted by `started_at`
    /// descending.
    pub fn list_audits(&self, project: Option<&str>) -> Result<Vec<AuditRecord>> {
        let path = self.audits_file();
        let content = lock::read_locked(&path)?;
        let mut audits = Self::load_audits(content.as_deref(), &path)?.audits;
        if let Some(project) = project {
            audits.retain(|a| a.project.as_deref() == Some(project));
        }
        audits.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(audits)
    }

    /// Replace a whole audit record. Returns false if the ID is unknown.
    pub fn put_audit(&self, record: &AuditRecord) -> Result<bool> {
        let path = self.audits_file();
        let record = record.clone();
        let found = lock::update_locked(&path, |current| {
            let mut file = Self::load_audits(current, &path)?;
            let Some(slot) = file.audits.iter_mut().find(|a| a.id == record.id) else {
                return Ok((None, false));
            };
            *slot = record;
            let content = Self::serialize_json(&file, &path)?;
            Ok((Some(content), true))
        })?;
        Ok(found)
    }

    /// Partial update: `delta` is JSON-merged into the stored record, so
    /// fields this build does not know about are preserved. Returns false
    /// for unknown IDs.
    pub fn update_audit(&self, id: Uuid, delta: &Value) -> Result<bool> {
        let path = self.audits_file();
        let delta = delta.clone();
        let found = lock::update_locked(&path, |current| {
            let Some(content) = current else {
                return Ok((None, false));
            };
            let mut raw: Value = serde_json::from_str(content).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                message: e.to_string(),
            })?;
            let (upgraded, _) = migrate::upgrade(migrate::FileKind::Audits, raw.take());
            raw = upgraded;

            let id_str = id.to_string();
            let Some(slot) = raw
                .get_mut("audits")
                .and_then(Value::as_array_mut)
                .and_then(|audits| {
                    audits
                        .iter_mut()
                        .find(|a| a.get("id").and_then(Value::as_str) == Some(id_str.as_str()))
                })
            else {
                return Ok((None, false));
            };
            json_merge(slot, &delta);
            let content = Self::serialize_json(&raw, &path)?;
            Ok((Some(content), true))
        })?;
        Ok(found)
    }

    /// The explicit destroy path: mark an audit abandoned.
    pub fn abandon_audit(&self, id: Uuid) -> Result<bool> {
        self.update_audit(
            id,
            &serde_json::json!({
                "status": AuditStatus::Abandoned,
                "completed_at": crate::util::now_iso(),
            }),
        )
    }

    // Events

    fn load_events(content: Option<&str>, path: &Path) -> Result<EventsFile, StoreError> {
        let Some(content) = content else {
            return Ok(EventsFile {
                version: migrate::CURRENT_VERSION,
                events: Vec::new(),
            });
        };
        let raw: Value = serde_json::from_str(content).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let (upgraded, _) = migrate::upgrade(migrate::FileKind::Events, raw);
        serde_json::from_value(upgraded).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Atomic append to the event log.
    pub fn append_event(&self, event: &Event) -> Result<()> {
        let path = self.events_file();
        let event = event.clone();
        lock::update_locked(&path, |current| {
            let mut file = Self::load_events(current, &path)?;
            file.events.push(event);
            let content = Self::serialize_json(&file, &path)?;
            Ok((Some(content), ()))
        })?;
        Ok(())
    }

    /// Events matching the filter, sorted by timestamp ascending. Ties
    /// keep log insertion order (the sort is stable).
    pub fn get_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let path = self.events_file();
        let content = lock::read_locked(&path)?;
        let mut events = Self::load_events(content.as_deref(), &path)?.events;
        if let Some(audit_id) = filter.audit_id {
            events.retain(|e| e.audit_id == audit_id);
        }
        if let Some(ty) = filter.event_type {
            events.retain(|e| e.event_type == ty);
        }
        if let Some(since) = filter.since {
            let bound = crate::util::iso_millis(since);
            events.retain(|e| e.timestamp >= bound);
        }
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(events)
    }

    /// Prune the event log. Removes events older than `before` (when
    /// given), then applies `retention_days` and `max_events` from
    /// config. Returns the number removed.
    pub fn clear_events(&self, before: Option<DateTime<Utc>>) -> Result<usize> {
        let config = self.get_config()?;
        let retention_bound = Utc::now() - chrono::Duration::days(config.events.retention_days as i64);
        let cutoff = crate::util::iso_millis(match before {
            Some(before) => before.max(retention_bound),
            None => retention_bound,
        });
        let max_events = config.events.max_events;

        let path = self.events_file();
        let removed = lock::update_locked(&path, |current| {
            let mut file = Self::load_events(current, &path)?;
            let original = file.events.len();
            file.events.retain(|e| e.timestamp >= cutoff);
            if file.events.len() > max_events {
                let excess = file.events.len() - max_events;
                file.events.drain(..excess);
            }
            let removed = original - file.events.len();
            let content = Self::serialize_json(&file, &path)?;
            Ok((Some(content), removed))
        })?;
        Ok(removed)
    }

    // Config

    /// Typed configuration, deep-merged with defaults.
    pub fn get_config(&self) -> Result<PhaserConfig> {
        let content = lock::read_locked(&self.config_file())?.unwrap_or_default();
        PhaserConfig::from_yaml(&content)
    }

    /// Raw configuration tree as written (no defaults merged in).
    pub fn raw_config(&self) -> Result<serde_yaml::Value> {
        let content = lock::read_locked(&self.config_file())?.unwrap_or_default();
        if content.trim().is_empty() {
            return Ok(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
        }
        serde_yaml::from_str(&content).context("Failed to parse config.yaml")
    }

    /// Set one dotted key in `config.yaml`.
    pub fn set_config(&self, dotted_key: &str, raw_value: &str) -> Result<()> {
        let mut tree = self.raw_config()?;
        if !matches!(tree, serde_yaml::Value::Mapping(_)) {
            tree = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }
        crate::config::set_dotted(&mut tree, dotted_key, raw_value)?;
        // Validate the result before persisting.
        let merged = serde_yaml::to_string(&tree)?;
        PhaserConfig::from_yaml(&merged)
            .with_context(|| format!("Rejected config value for '{}'", dotted_key))?;
        lock::write_locked(&self.config_file(), &merged)?;
        Ok(())
    }

    /// Restore default configuration.
    pub fn reset_config(&self) -> Result<()> {
        let defaults = PhaserConfig::default().to_yaml()?;
        lock::write_locked(&self.config_file(), &defaults)?;
        Ok(())
    }

    // Replays

    /// Append a replay record to the history.
    pub fn append_replay(&self, record: &ReplayRecord) -> Result<()> {
        let path = self.replays_file();
        let record = record.clone();
        lock::update_locked(&path, |current| {
            let mut file = match current {
                None => ReplaysFile {
                    version: migrate::CURRENT_VERSION,
                    replays: Vec::new(),
                },
                Some(content) => {
                    let raw: Value =
                        serde_json::from_str(content).map_err(|e| StoreError::Corrupt {
                            path: path.clone(),
                            message: e.to_string(),
                        })?;
                    let (upgraded, _) = migrate::upgrade(migrate::FileKind::Replays, raw);
                    serde_json::from_value(upgraded).map_err(|e| StoreError::Corrupt {
                        path: path.clone(),
                        message: e.to_string(),
                    })?
                }
            };
            file.replays.push(record);
            let content = Self::serialize_json(&file, &path)?;
            Ok((Some(content), ()))
        })?;
        Ok(())
    }

    pub fn list_replays(&self) -> Result<Vec<ReplayRecord>> {
        let path = self.replays_file();
        let Some(content) = lock::read_locked(&path)? else {
            return Ok(Vec::new());
        };
        let raw: Value = serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let (upgraded, _) = migrate::upgrade(migrate::FileKind::Replays, raw);
        let file: ReplaysFile = serde_json::from_value(upgraded).map_err(|e| StoreError::Corrupt {
            path,
            message: e.to_string(),
        })?;
        Ok(file.replays)
    }
}

/// JSON merge: objects merge key-by-key, everything else replaces.
/// Used for forward-compatible partial audit updates.
pub fn json_merge(base: &mut Value, delta: &Value) {
    match (base, delta) {
        (Value::Object(base_map), Value::Object(delta_map)) => {
            for (key, value) in delta_map {
                match base_map.get_mut(key) {
                    Some(existing) => json_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, delta) => {
            *base = delta.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Phase;
    use serde_json::json;
    use tempfile::tempdir;

    fn store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::at(dir.path().join(STORE_DIR_NAME)).unwrap();
        (store, dir)
    }

    fn sample_event(audit_id: Uuid, ty: EventType, ts: &str) -> Event {
        let mut event = Event::new(ty, audit_id, None, serde_json::Map::new());
        event.timestamp = ts.to_string();
        event
    }

    // =========================================
    // Resolution
    // =========================================

    #[test]
    fn test_resolve_prefers_project_local_ancestor() {
        let dir = tempdir().unwrap();
        let local = dir.path().join(STORE_DIR_NAME);
        std::fs::create_dir_all(&local).unwrap();
        let nested = dir.path().join("src/deep");
        std::fs::create_dir_all(&nested).unwrap();
        let resolved = resolve_store_root(&nested).unwrap();
        assert_eq!(resolved, local);
    }

    // =========================================
    // Audits
    // =========================================

    #[test]
    fn test_save_and_get_audit() {
        let (store, _dir) = store();
        let record = AuditRecord::new("My Audit", "audit.md");
        let id = store.save_audit(&record).unwrap();
        let loaded = store.get_audit(id).unwrap().unwrap();
        assert_eq!(loaded.title, "My Audit");
        assert_eq!(loaded.slug, "my-audit");
    }

    #[test]
    fn test_get_audit_unknown_is_none() {
        let (store, _dir) = store();
        assert!(store.get_audit(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_list_audits_sorted_descending() {
        let (store, _dir) = store();
        let mut first = AuditRecord::new("First", "a.md");
        first.started_at = "2025-01-01T00:00:00.000Z".to_string();
        let mut second = AuditRecord::new("Second", "b.md");
        second.started_at = "2025-06-01T00:00:00.000Z".to_string();
        store.save_audit(&first).unwrap();
        store.save_audit(&second).unwrap();
        let listed = store.list_audits(None).unwrap();
        assert_eq!(listed[0].title, "Second");
        assert_eq!(listed[1].title, "First");
    }

    #[test]
    fn test_list_audits_project_filter() {
        let (store, _dir) = store();
        let mut a = AuditRecord::new("A", "a.md");
        a.project = Some("alpha".to_string());
        let mut b = AuditRecord::new("B", "b.md");
        b.project = Some("beta".to_string());
        store.save_audit(&a).unwrap();
        store.save_audit(&b).unwrap();
        let listed = store.list_audits(Some("alpha")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "A");
    }

    #[test]
    fn test_update_audit_partial_merge_preserves_unknown() {
        let (store, _dir) = store();
        let record = AuditRecord::new("X", "x.md");
        let id = store.save_audit(&record).unwrap();

        // Simulate a future field written by a newer build
        store
            .update_audit(id, &json!({"future_field": "kept"}))
            .unwrap();
        // This build updates status only
        let updated = store
            .update_audit(id, &json!({"status": "in_progress"}))
            .unwrap();
        assert!(updated);

        let loaded = store.get_audit(id).unwrap().unwrap();
        assert_eq!(loaded.status, AuditStatus::InProgress);
        assert_eq!(loaded.extra["future_field"], "kept");
    }

    #[test]
    fn test_update_audit_unknown_id_false() {
        let (store, _dir) = store();
        store.save_audit(&AuditRecord::new("X", "x.md")).unwrap();
        let updated = store
            .update_audit(Uuid::new_v4(), &json!({"status": "completed"}))
            .unwrap();
        assert!(!updated);
    }

    #[test]
    fn test_put_audit_replaces_record() {
        let (store, _dir) = store();
        let mut record = AuditRecord::new("X", "x.md");
        let id = store.save_audit(&record).unwrap();
        record.phases.push(Phase::new(1, "One"));
        record.status = AuditStatus::InProgress;
        assert!(store.put_audit(&record).unwrap());
        let loaded = store.get_audit(id).unwrap().unwrap();
        assert_eq!(loaded.phases.len(), 1);
        assert_eq!(loaded.status, AuditStatus::InProgress);
    }

    #[test]
    fn test_abandon_audit() {
        let (store, _dir) = store();
        let id = store.save_audit(&AuditRecord::new("X", "x.md")).unwrap();
        assert!(store.abandon_audit(id).unwrap());
        let loaded = store.get_audit(id).unwrap().unwrap();
        assert_eq!(loaded.status, AuditStatus::Abandoned);
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn test_corrupt_audits_file_fails_loudly() {
        let (store, _dir) = store();
        std::fs::write(store.audits_file(), "{not json").unwrap();
        let err = store.get_audit(Uuid::new_v4()).unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("Corrupt"), "unexpected error: {}", msg);
        // Parse position is surfaced
        assert!(msg.contains("line"), "expected parse position in: {}", msg);
    }

    // =========================================
    // Events
    // =========================================

    #[test]
    fn test_append_and_get_events_sorted() {
        let (store, _dir) = store();
        let audit_id = Uuid::new_v4();
        store
            .append_event(&sample_event(
                audit_id,
                EventType::PhaseStarted,
                "2025-01-02T00:00:00.000Z",
            ))
            .unwrap();
        store
            .append_event(&sample_event(
                audit_id,
                EventType::AuditStarted,
                "2025-01-01T00:00:00.000Z",
            ))
            .unwrap();
        let events = store
            .get_events(&EventFilter {
                audit_id: Some(audit_id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::AuditStarted);
        assert_eq!(events[1].event_type, EventType::PhaseStarted);
    }

    #[test]
    fn test_get_events_type_filter() {
        let (store, _dir) = store();
        let audit_id = Uuid::new_v4();
        store
            .append_event(&sample_event(
                audit_id,
                EventType::PhaseStarted,
                "2025-01-01T00:00:00.000Z",
            ))
            .unwrap();
        store
            .append_event(&sample_event(
                audit_id,
                EventType::PhaseCompleted,
                "2025-01-01T00:00:01.000Z",
            ))
            .unwrap();
        let events = store
            .get_events(&EventFilter {
                event_type: Some(EventType::PhaseCompleted),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_events_tie_on_timestamp_keeps_insertion_order() {
        let (store, _dir) = store();
        let audit_id = Uuid::new_v4();
        let ts = "2025-01-01T00:00:00.000Z";
        let first = sample_event(audit_id, EventType::FileCreated, ts);
        let second = sample_event(audit_id, EventType::FileModified, ts);
        store.append_event(&first).unwrap();
        store.append_event(&second).unwrap();
        let events = store.get_events(&EventFilter::default()).unwrap();
        assert_eq!(events[0].id, first.id);
        assert_eq!(events[1].id, second.id);
    }

    #[test]
    fn test_clear_events_before_bound() {
        let (store, _dir) = store();
        let audit_id = Uuid::new_v4();
        store
            .append_event(&sample_event(
                audit_id,
                EventType::AuditStarted,
                "2020-01-01T00:00:00.000Z",
            ))
            .unwrap();
        store
            .append_event(&sample_event(
                audit_id,
                EventType::AuditCompleted,
                &crate::util::now_iso(),
            ))
            .unwrap();
        let removed = store.clear_events(None).unwrap();
        assert_eq!(removed, 1);
        let events = store.get_events(&EventFilter::default()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::AuditCompleted);
    }

    #[test]
    fn test_clear_events_applies_max_events() {
        let (store, _dir) = store();
        store.set_config("events.max_events", "2").unwrap();
        // Keep retention out of the picture for this test
        store.set_config("events.retention_days", "36500").unwrap();
        let audit_id = Uuid::new_v4();
        for i in 0..5 {
            store
                .append_event(&sample_event(
                    audit_id,
                    EventType::FileModified,
                    &format!("2025-06-0{}T00:00:00.000Z", i + 1),
                ))
                .unwrap();
        }
        let removed = store.clear_events(None).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.get_events(&EventFilter::default()).unwrap().len(), 2);
    }

    // =========================================
    // Config
    // =========================================

    #[test]
    fn test_config_defaults_when_missing() {
        let (store, _dir) = store();
        let config = store.get_config().unwrap();
        assert_eq!(config.engine.retries, 3);
    }

    #[test]
    fn test_set_config_dotted_key() {
        let (store, _dir) = store();
        store.set_config("engine.retries", "7").unwrap();
        assert_eq!(store.get_config().unwrap().engine.retries, 7);
        // Sibling defaults survive
        assert_eq!(
            store.get_config().unwrap().engine.verification_timeout_secs,
            60
        );
    }

    #[test]
    fn test_set_config_rejects_bad_type() {
        let (store, _dir) = store();
        assert!(store.set_config("engine.retries", "not-a-number").is_err());
    }

    #[test]
    fn test_reset_config() {
        let (store, _dir) = store();
        store.set_config("engine.retries", "9").unwrap();
        store.reset_config().unwrap();
        assert_eq!(store.get_config().unwrap().engine.retries, 3);
    }

    // =========================================
    // Replays
    // =========================================

    #[test]
    fn test_replay_history_appends() {
        let (store, _dir) = store();
        let record = ReplayRecord {
            audit_id: Uuid::new_v4(),
            slug: "cleanup".to_string(),
            timestamp: crate::util::now_iso(),
            scope: "all".to_string(),
            regressions: vec!["src/a.rs".to_string()],
        };
        store.append_replay(&record).unwrap();
        let listed = store.list_replays().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], record);
    }

    // =========================================
    // json_merge
    // =========================================

    #[test]
    fn test_json_merge_nested() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": "keep"});
        json_merge(&mut base, &json!({"a": {"y": 9}}));
        assert_eq!(base["a"]["x"], 1);
        assert_eq!(base["a"]["y"], 9);
        assert_eq!(base["b"], "keep");
    }

    #[test]
    fn test_json_merge_array_replaces() {
        let mut base = json!({"list": [1, 2, 3]});
        json_merge(&mut base, &json!({"list": [9]}));
        assert_eq!(base["list"], json!([9]));
    }
}
