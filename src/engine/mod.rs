//! The phase lifecycle engine.
//!
//! Drives one audit end to end: for each pending phase it emits
//! `phase_started`, hands the phase to the executor (the agent seam),
//! runs the verification steps, retries on failure, and marks the phase
//! terminal. Every transition emits an event and persists the audit
//! record atomically, so an interrupted run resumes exactly where it
//! stopped.

pub mod verify;

pub use verify::VerificationOutcome;

use crate::audit::{AuditRecord, AuditStatus, Phase, PhaseStatus};
use crate::events::{self, EventBus, EventType};
use crate::manifest::{self, CaptureOptions, DiffResult, Manifest};
use crate::sandbox::{BranchMode, Simulation};
use crate::store::Store;
use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Options for one engine run.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Verification retries per phase after the first attempt.
    pub retries: u32,
    /// Stop at the first failed phase.
    pub fail_fast: bool,
    /// Emit lifecycle events (off for dry runs).
    pub emit: bool,
    /// Run inside a simulation sandbox.
    pub simulate: bool,
    /// Run in branch mode, one branch per phase.
    pub branch: bool,
    /// Deadline per verification command.
    pub verification_timeout: Duration,
    /// Manifest capture settings for file-change tracking.
    pub capture: CaptureOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            fail_fast: false,
            emit: true,
            simulate: false,
            branch: false,
            verification_timeout: Duration::from_secs(60),
            capture: CaptureOptions::default(),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &crate::config::PhaserConfig) -> Self {
        Self {
            retries: config.engine.retries,
            verification_timeout: Duration::from_secs(config.engine.verification_timeout_secs),
            capture: CaptureOptions::from_config(&config.manifest),
            ..Default::default()
        }
    }
}

/// The seam to the agent that actually edits files. The engine prepares
/// inputs and consumes outcomes; what happens in between is out of its
/// hands.
pub trait PhaseExecutor {
    fn execute(&mut self, audit: &AuditRecord, phase: &Phase) -> Result<()>;
}

/// Executor that changes nothing. The real agent is external; this is
/// what `execute` uses when invoked without one.
pub struct NoopExecutor;

impl PhaseExecutor for NoopExecutor {
    fn execute(&mut self, _audit: &AuditRecord, _phase: &Phase) -> Result<()> {
        Ok(())
    }
}

/// Summary of one engine run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub status: AuditStatus,
    pub phases_completed: usize,
    pub phases_failed: usize,
    pub phases_skipped: usize,
    pub duration_ms: u64,
}

pub struct PhaseEngine {
    store: Store,
    bus: EventBus,
    root: PathBuf,
    options: EngineOptions,
    cancel: Arc<AtomicBool>,
}

impl PhaseEngine {
    pub fn new(store: Store, bus: EventBus, root: PathBuf, options: EngineOptions) -> Self {
        Self {
            store,
            bus,
            root,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for cooperative cancellation (wired to Ctrl-C by the CLI).
    /// On cancellation the current phase reverts to pending so a resume
    /// picks it up; stash and branch state are left untouched.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn emit(
        &self,
        event_type: EventType,
        audit: &AuditRecord,
        phase: Option<u32>,
        data: serde_json::Map<String, serde_json::Value>,
    ) {
        if self.options.emit {
            self.bus.emit(event_type, audit.id, phase, data);
        }
    }

    fn persist(&self, audit: &AuditRecord) -> Result<()> {
        if !self.store.put_audit(audit)? {
            self.store.save_audit(audit)?;
        }
        Ok(())
    }

    /// Run every pending phase of the audit.
    pub async fn run(
        &self,
        audit: &mut AuditRecord,
        executor: &mut dyn PhaseExecutor,
    ) -> Result<RunSummary> {
        let run_started = Instant::now();

        audit.status = AuditStatus::InProgress;
        self.emit(
            EventType::AuditStarted,
            audit,
            None,
            serde_json::Map::from_iter([("slug".to_string(), json!(audit.slug))]),
        );
        self.persist(audit)?;

        let branch_mode = if self.options.branch {
            let mode = BranchMode::new(self.store.clone(), self.root.clone());
            if mode.load()?.filter(|c| c.active).is_none() {
                mode.begin(audit.id, &audit.slug, None)?;
            }
            Some(mode)
        } else {
            None
        };
        let simulation = if self.options.simulate {
            let sim = Simulation::new(self.store.clone(), self.root.clone());
            if sim.load()?.filter(|c| c.active).is_none() {
                sim.begin(audit.id)?;
            }
            Some(sim)
        } else {
            None
        };

        // Announce phases the negotiation already skipped.
        for phase in audit
            .phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Skipped)
        {
            self.emit(
                EventType::PhaseSkipped,
                audit,
                Some(phase.number),
                serde_json::Map::from_iter([("phase_id".to_string(), json!(phase.id))]),
            );
        }

        let mut pre_manifest_saved = self.store.manifests_dir(audit.id).join("pre.yaml").exists();
        let phase_indices: Vec<usize> = (0..audit.phases.len()).collect();

        'phases: for idx in phase_indices {
            if audit.phases[idx].status != PhaseStatus::Pending {
                continue;
            }
            if self.cancelled() {
                break;
            }

            let phase_number = audit.phases[idx].number;
            let phase_started = Instant::now();
            audit.phases[idx].status = PhaseStatus::Executing;
            audit.phases[idx].started_at = Some(crate::util::now_iso());
            self.emit(
                EventType::PhaseStarted,
                audit,
                Some(phase_number),
                serde_json::Map::from_iter([
                    ("phase_id".to_string(), json!(audit.phases[idx].id)),
                    ("title".to_string(), json!(audit.phases[idx].title)),
                ]),
            );
            self.persist(audit)?;

            if let Some(mode) = &branch_mode {
                let slug = audit.phases[idx].slug();
                mode.create_phase_branch(phase_number, &slug)?;
            }

            let mut last_failure: Option<VerificationOutcome> = None;
            let mut phase_diff: Option<DiffResult> = None;

            for attempt in 0..=self.options.retries {
                if self.cancelled() {
                    break;
                }
                audit.phases[idx].attempts = attempt + 1;

                let pre = manifest::capture(&self.root, &self.options.capture)?;
                if !pre_manifest_saved {
                    pre.save(&self.store.manifests_dir(audit.id).join("pre.yaml"))?;
                    pre_manifest_saved = true;
                }

                if let Err(e) = executor.execute(audit, &audit.phases[idx].clone()) {
                    last_failure = Some(VerificationOutcome {
                        command: "<execute>".to_string(),
                        exit_code: -1,
                        duration_ms: 0,
                        output: crate::util::truncate_output(&format!("{:#}", e), 1000),
                        passed: false,
                    });
                    continue;
                }

                let failure = self.run_verifications(audit, idx).await?;

                let post = manifest::capture(&self.root, &self.options.capture)?;
                let diff = manifest::compare(&pre, &post);
                self.record_post_manifest(audit, &post)?;

                match failure {
                    None => {
                        phase_diff = Some(diff);
                        last_failure = None;
                        break;
                    }
                    Some(outcome) => {
                        last_failure = Some(outcome);
                    }
                }
            }

            if self.cancelled() {
                // Resume picks this phase up again.
                audit.phases[idx].status = PhaseStatus::Pending;
                audit.phases[idx].started_at = None;
                self.persist(audit)?;
                break;
            }

            match last_failure {
                None => {
                    let diff = phase_diff.unwrap_or_default();
                    self.emit_file_events(audit, phase_number, &diff);
                    audit.counters.files_created += diff.added.len() as u64;
                    audit.counters.files_modified += diff.modified.len() as u64;
                    audit.counters.files_deleted += diff.deleted.len() as u64;
                    if let Some(sim) = &simulation
                        && let Some(mut context) = sim.load()?
                    {
                        sim.track(&mut context, &diff)?;
                    }
                    if let Some(mode) = &branch_mode {
                        let title = audit.phases[idx].title.clone();
                        mode.commit_phase(phase_number, &title, None)?;
                    }

                    audit.phases[idx].status = PhaseStatus::Completed;
                    audit.phases[idx].completed_at = Some(crate::util::now_iso());
                    self.emit(
                        EventType::PhaseCompleted,
                        audit,
                        Some(phase_number),
                        events::phase_completed_payload(
                            phase_started.elapsed().as_millis() as u64,
                            diff.added.len() as u64,
                            diff.modified.len() as u64,
                            diff.deleted.len() as u64,
                        ),
                    );
                    self.persist(audit)?;
                }
                Some(outcome) => {
                    audit.phases[idx].status = PhaseStatus::Failed;
                    audit.phases[idx].completed_at = Some(crate::util::now_iso());
                    self.emit(
                        EventType::PhaseFailed,
                        audit,
                        Some(phase_number),
                        serde_json::Map::from_iter([
                            ("command".to_string(), json!(outcome.command)),
                            ("exit_code".to_string(), json!(outcome.exit_code)),
                            ("error".to_string(), json!(outcome.output)),
                            ("attempts".to_string(), json!(audit.phases[idx].attempts)),
                        ]),
                    );
                    self.persist(audit)?;
                    if self.options.fail_fast {
                        break 'phases;
                    }
                }
            }
        }

        let all_terminal = audit.phases.iter().all(|p| p.status.is_terminal());
        let duration_ms = run_started.elapsed().as_millis() as u64;

        if all_terminal {
            audit.status = if audit.phases_failed() > 0 {
                AuditStatus::Partial
            } else {
                AuditStatus::Completed
            };
            audit.completed_at = Some(crate::util::now_iso());
            self.emit(
                EventType::AuditCompleted,
                audit,
                None,
                events::audit_completed_payload(
                    duration_ms,
                    audit.phases_completed(),
                    audit.phases_skipped(),
                    &audit.counters,
                ),
            );
        }
        self.persist(audit)?;

        Ok(RunSummary {
            status: audit.status,
            phases_completed: audit.phases_completed(),
            phases_failed: audit.phases_failed(),
            phases_skipped: audit.phases_skipped(),
            duration_ms,
        })
    }

    /// Run all verification steps of a phase. Returns the first failing
    /// outcome, or `None` when every step passed.
    async fn run_verifications(
        &self,
        audit: &AuditRecord,
        idx: usize,
    ) -> Result<Option<VerificationOutcome>> {
        let steps = audit.phases[idx].verification.clone();
        let phase_number = audit.phases[idx].number;
        for step in steps {
            let outcome =
                verify::run_step(&step, &self.root, self.options.verification_timeout).await?;
            let event_type = if outcome.passed {
                EventType::VerificationPassed
            } else {
                EventType::VerificationFailed
            };
            self.emit(
                event_type,
                audit,
                Some(phase_number),
                events::verification_payload(
                    &outcome.command,
                    outcome.exit_code,
                    outcome.duration_ms,
                    &outcome.output,
                ),
            );
            if !outcome.passed {
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    fn emit_file_events(&self, audit: &AuditRecord, phase: u32, diff: &DiffResult) {
        for change in &diff.added {
            self.emit(
                EventType::FileCreated,
                audit,
                Some(phase),
                events::file_event_payload(&change.path),
            );
        }
        for change in &diff.modified {
            self.emit(
                EventType::FileModified,
                audit,
                Some(phase),
                events::file_event_payload(&change.path),
            );
        }
        for change in &diff.deleted {
            self.emit(
                EventType::FileDeleted,
                audit,
                Some(phase),
                events::file_event_payload(&change.path),
            );
        }
    }

    fn record_post_manifest(&self, audit: &AuditRecord, post: &Manifest) -> Result<()> {
        post.save(&self.store.manifests_dir(audit.id).join("post.yaml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventFilter;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    /// Executor that runs a closure per phase, keyed by phase number.
    struct ScriptedExecutor<F: FnMut(u32)> {
        script: F,
    }

    impl<F: FnMut(u32)> PhaseExecutor for ScriptedExecutor<F> {
        fn execute(&mut self, _audit: &AuditRecord, phase: &Phase) -> Result<()> {
            (self.script)(phase.number);
            Ok(())
        }
    }

    fn fixture(root: &Path) -> (Store, EventBus, AuditRecord) {
        let store = Store::at(root.join(".phaser")).unwrap();
        let bus = EventBus::with_store(store.clone());
        let audit = AuditRecord::new("Engine Test", "audit.md");
        (store, bus, audit)
    }

    fn phase_with_verification(number: u32, title: &str, verification: &[&str]) -> Phase {
        let mut phase = Phase::new(number, title);
        phase.verification = verification.iter().map(|s| s.to_string()).collect();
        phase
    }

    #[tokio::test]
    async fn test_run_completes_passing_phases() {
        let dir = tempdir().unwrap();
        let (store, bus, mut audit) = fixture(dir.path());
        audit.phases.push(phase_with_verification(1, "One", &["true"]));
        audit.phases.push(phase_with_verification(2, "Two", &["true"]));
        store.save_audit(&audit).unwrap();

        let engine = PhaseEngine::new(
            store.clone(),
            bus,
            dir.path().to_path_buf(),
            EngineOptions::default(),
        );
        let mut executor = ScriptedExecutor { script: |_| {} };
        let summary = engine.run(&mut audit, &mut executor).await.unwrap();

        assert_eq!(summary.status, AuditStatus::Completed);
        assert_eq!(summary.phases_completed, 2);
        assert_eq!(summary.phases_failed, 0);

        let stored = store.get_audit(audit.id).unwrap().unwrap();
        assert_eq!(stored.status, AuditStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert!(stored.phases.iter().all(|p| p.status == PhaseStatus::Completed));
    }

    #[tokio::test]
    async fn test_every_completed_phase_has_a_started_event() {
        let dir = tempdir().unwrap();
        let (store, bus, mut audit) = fixture(dir.path());
        audit.phases.push(phase_with_verification(1, "One", &["true"]));
        store.save_audit(&audit).unwrap();

        let engine = PhaseEngine::new(
            store.clone(),
            bus,
            dir.path().to_path_buf(),
            EngineOptions::default(),
        );
        engine
            .run(&mut audit, &mut ScriptedExecutor { script: |_| {} })
            .await
            .unwrap();

        let events = store
            .get_events(&EventFilter {
                audit_id: Some(audit.id),
                ..Default::default()
            })
            .unwrap();
        for completed in events
            .iter()
            .filter(|e| e.event_type == EventType::PhaseCompleted)
        {
            assert!(events.iter().any(|e| {
                e.event_type == EventType::PhaseStarted
                    && e.phase == completed.phase
                    && e.timestamp <= completed.timestamp
            }));
        }
    }

    #[tokio::test]
    async fn test_failed_verification_retries_then_fails() {
        let dir = tempdir().unwrap();
        let (store, bus, mut audit) = fixture(dir.path());
        audit
            .phases
            .push(phase_with_verification(1, "Broken", &["false"]));
        store.save_audit(&audit).unwrap();

        let options = EngineOptions {
            retries: 2,
            ..Default::default()
        };
        let engine = PhaseEngine::new(store.clone(), bus, dir.path().to_path_buf(), options);
        let summary = engine
            .run(&mut audit, &mut ScriptedExecutor { script: |_| {} })
            .await
            .unwrap();

        assert_eq!(summary.status, AuditStatus::Partial);
        assert_eq!(summary.phases_failed, 1);
        assert_eq!(audit.phases[0].attempts, 3); // 1 initial + 2 retries

        let events = store
            .get_events(&EventFilter {
                audit_id: Some(audit.id),
                event_type: Some(EventType::VerificationFailed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 3);
        let failed = store
            .get_events(&EventFilter {
                audit_id: Some(audit.id),
                event_type: Some(EventType::PhaseFailed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].data["attempts"], serde_json::json!(3));
    }

    #[tokio::test]
    async fn test_fail_fast_leaves_later_phases_pending() {
        let dir = tempdir().unwrap();
        let (store, bus, mut audit) = fixture(dir.path());
        audit
            .phases
            .push(phase_with_verification(1, "Broken", &["false"]));
        audit.phases.push(phase_with_verification(2, "Never", &["true"]));
        store.save_audit(&audit).unwrap();

        let options = EngineOptions {
            retries: 0,
            fail_fast: true,
            ..Default::default()
        };
        let engine = PhaseEngine::new(store.clone(), bus, dir.path().to_path_buf(), options);
        let summary = engine
            .run(&mut audit, &mut ScriptedExecutor { script: |_| {} })
            .await
            .unwrap();

        assert_eq!(audit.phases[0].status, PhaseStatus::Failed);
        assert_eq!(audit.phases[1].status, PhaseStatus::Pending);
        // Not all terminal: the audit stays in progress for a resume
        assert_eq!(summary.status, AuditStatus::InProgress);
    }

    #[tokio::test]
    async fn test_file_changes_emit_events_and_counters() {
        let dir = tempdir().unwrap();
        let (store, bus, mut audit) = fixture(dir.path());
        audit
            .phases
            .push(phase_with_verification(1, "Create File", &["true"]));
        store.save_audit(&audit).unwrap();

        let engine = PhaseEngine::new(
            store.clone(),
            bus,
            dir.path().to_path_buf(),
            EngineOptions::default(),
        );
        let root = dir.path().to_path_buf();
        let mut executor = ScriptedExecutor {
            script: move |_| {
                fs::write(root.join("made-by-phase.txt"), "content").unwrap();
            },
        };
        engine.run(&mut audit, &mut executor).await.unwrap();

        assert_eq!(audit.counters.files_created, 1);
        let created = store
            .get_events(&EventFilter {
                audit_id: Some(audit.id),
                event_type: Some(EventType::FileCreated),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].data["path"], serde_json::json!("made-by-phase.txt"));
    }

    #[tokio::test]
    async fn test_completed_counts_match_totals() {
        let dir = tempdir().unwrap();
        let (store, bus, mut audit) = fixture(dir.path());
        audit.phases.push(phase_with_verification(1, "Ok", &["true"]));
        let mut skipped = phase_with_verification(2, "Skipped", &["true"]);
        skipped.status = PhaseStatus::Skipped;
        audit.phases.push(skipped);
        audit
            .phases
            .push(phase_with_verification(3, "Bad", &["false"]));
        store.save_audit(&audit).unwrap();

        let options = EngineOptions {
            retries: 0,
            ..Default::default()
        };
        let engine = PhaseEngine::new(store, bus, dir.path().to_path_buf(), options);
        let summary = engine
            .run(&mut audit, &mut ScriptedExecutor { script: |_| {} })
            .await
            .unwrap();

        assert_eq!(
            summary.phases_completed + summary.phases_skipped + summary.phases_failed,
            audit.phases.len()
        );
        assert_eq!(summary.status, AuditStatus::Partial);
    }

    #[tokio::test]
    async fn test_emit_false_suppresses_events() {
        let dir = tempdir().unwrap();
        let (store, bus, mut audit) = fixture(dir.path());
        audit.phases.push(phase_with_verification(1, "Quiet", &["true"]));
        store.save_audit(&audit).unwrap();

        let options = EngineOptions {
            emit: false,
            ..Default::default()
        };
        let engine = PhaseEngine::new(store.clone(), bus, dir.path().to_path_buf(), options);
        engine
            .run(&mut audit, &mut ScriptedExecutor { script: |_| {} })
            .await
            .unwrap();

        let events = store.get_events(&EventFilter::default()).unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_reverts_phase_to_pending() {
        let dir = tempdir().unwrap();
        let (store, bus, mut audit) = fixture(dir.path());
        audit.phases.push(phase_with_verification(1, "One", &["true"]));
        audit.phases.push(phase_with_verification(2, "Two", &["true"]));
        store.save_audit(&audit).unwrap();

        let engine = PhaseEngine::new(
            store.clone(),
            bus,
            dir.path().to_path_buf(),
            EngineOptions::default(),
        );
        let cancel = engine.cancel_handle();
        let mut executor = ScriptedExecutor {
            script: move |number| {
                if number == 1 {
                    // Request cancellation mid-run
                    cancel.store(true, Ordering::SeqCst);
                }
            },
        };
        let summary = engine.run(&mut audit, &mut executor).await.unwrap();

        assert_eq!(summary.status, AuditStatus::InProgress);
        assert_eq!(audit.phases[0].status, PhaseStatus::Pending);
        assert_eq!(audit.phases[1].status, PhaseStatus::Pending);
        // No terminal phase events were emitted
        let events = store
            .get_events(&EventFilter {
                audit_id: Some(audit.id),
                event_type: Some(EventType::PhaseCompleted),
                ..Default::default()
            })
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_pre_and_post_manifests_persisted() {
        let dir = tempdir().unwrap();
        let (store, bus, mut audit) = fixture(dir.path());
        audit.phases.push(phase_with_verification(1, "One", &["true"]));
        store.save_audit(&audit).unwrap();

        let engine = PhaseEngine::new(
            store.clone(),
            bus,
            dir.path().to_path_buf(),
            EngineOptions::default(),
        );
        engine
            .run(&mut audit, &mut ScriptedExecutor { script: |_| {} })
            .await
            .unwrap();

        let manifests = store.manifests_dir(audit.id);
        assert!(manifests.join("pre.yaml").exists());
        assert!(manifests.join("post.yaml").exists());
        Manifest::load(&manifests.join("post.yaml")).unwrap();
    }
}
