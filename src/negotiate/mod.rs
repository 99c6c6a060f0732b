//! Non-destructive negotiation over a parsed phase list.
//!
//! The engine never edits the original parse: it holds a frozen
//! `original_phases` plus a mutable `current_phases`, and every edit is
//! recorded in an append-only operation log that references phases by
//! stable ID. After any structural operation phases are renumbered 1..N;
//! a stable ID is rewritten only when it is the plain `phase-<n>` form —
//! suffixed IDs from splits are never touched, and no ID is ever reused.

pub mod session;

pub use session::{export_markdown, load_session, save_session, source_hash};

use crate::audit::Phase;
use anyhow::{Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

static PLAIN_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^phase-\d+$").unwrap());

/// The closed set of negotiation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Split,
    Merge,
    Reorder,
    Skip,
    Unskip,
    Modify,
    Reset,
}

/// One recorded operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationOp {
    pub op_type: OpType,
    pub timestamp: String,
    pub target_ids: Vec<String>,
    #[serde(default)]
    pub params: serde_yaml::Value,
    pub description: String,
}

/// Fields reachable through `modify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ModifyField {
    Title,
    Context,
    Goal,
    Plan,
    Verification,
    AcceptanceCriteria,
    Rollback,
}

/// The durable session state (`negotiate/<source-hash>.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationState {
    pub source_file: String,
    pub source_hash: String,
    pub created_at: String,
    pub modified_at: String,
    pub original_phases: Vec<Phase>,
    pub current_phases: Vec<Phase>,
    #[serde(default)]
    pub operations: Vec<NegotiationOp>,
    #[serde(default)]
    pub skipped_ids: BTreeSet<String>,
}

pub struct NegotiationEngine {
    pub state: NegotiationState,
}

impl NegotiationEngine {
    /// Open a fresh session over a parsed document.
    pub fn new(source_file: &str, source_content: &str, phases: Vec<Phase>) -> Self {
        let now = crate::util::now_iso();
        Self {
            state: NegotiationState {
                source_file: source_file.to_string(),
                source_hash: source_hash(source_content),
                created_at: now.clone(),
                modified_at: now,
                original_phases: phases.clone(),
                current_phases: phases,
                operations: Vec::new(),
                skipped_ids: BTreeSet::new(),
            },
        }
    }

    pub fn resume(state: NegotiationState) -> Self {
        Self { state }
    }

    fn find(&self, phase_id: &str) -> Result<usize> {
        self.state
            .current_phases
            .iter()
            .position(|p| p.id == phase_id)
            .ok_or_else(|| anyhow::anyhow!("No phase with id '{}'", phase_id))
    }

    fn log(&mut self, op_type: OpType, targets: Vec<String>, params: serde_yaml::Value, description: String) {
        self.state.operations.push(NegotiationOp {
            op_type,
            timestamp: crate::util::now_iso(),
            target_ids: targets,
            params,
            description,
        });
        self.state.modified_at = crate::util::now_iso();
    }

    /// Renumber 1..N. Only plain `phase-<n>` IDs follow their number;
    /// suffixed IDs stay stable.
    fn renumber(&mut self) {
        for (idx, phase) in self.state.current_phases.iter_mut().enumerate() {
            let number = (idx + 1) as u32;
            phase.number = number;
            if PLAIN_ID_RE.is_match(&phase.id) {
                phase.id = format!("phase-{}", number);
            }
        }
    }

    /// Split a phase at file indices. `split_at` lists the starting file
    /// index of each chunk after the first (so `[1, 2]` over three files
    /// yields three single-file phases); the default splits per file.
    /// Returns the new phase IDs.
    pub fn split(&mut self, phase_id: &str, split_at: Option<Vec<usize>>) -> Result<Vec<String>> {
        let idx = self.find(phase_id)?;
        let phase = self.state.current_phases[idx].clone();
        let file_count = phase.files.len();
        if file_count < 2 {
            bail!(
                "Phase '{}' has {} file change(s); splitting needs at least 2",
                phase_id,
                file_count
            );
        }

        let mut points = split_at.unwrap_or_else(|| (1..file_count).collect());
        points.sort_unstable();
        points.dedup();
        if points.iter().any(|p| *p == 0 || *p >= file_count) {
            bail!(
                "Split indices must lie in 1..{} for phase '{}'",
                file_count,
                phase_id
            );
        }

        // Chunk boundaries: [0, points..., file_count]
        let mut bounds = vec![0];
        bounds.extend(points.iter().copied());
        bounds.push(file_count);

        let base_id = phase.id.clone();
        let mut new_phases = Vec::new();
        for (part, window) in bounds.windows(2).enumerate() {
            let mut new_phase = phase.clone();
            new_phase.id = format!("{}{}", base_id, suffix_letters(part));
            new_phase.title = format!("{} (part {})", phase.title, part + 1);
            new_phase.files = phase.files[window[0]..window[1]].to_vec();
            new_phase.split_from = Some(base_id.clone());
            new_phase.merged_from = Vec::new();
            new_phases.push(new_phase);
        }
        let new_ids: Vec<String> = new_phases.iter().map(|p| p.id.clone()).collect();

        self.state
            .current_phases
            .splice(idx..=idx, new_phases);
        self.renumber();
        self.log(
            OpType::Split,
            vec![base_id.clone()],
            serde_yaml::to_value(&bounds).unwrap_or_default(),
            format!("split {} into {}", base_id, new_ids.join(", ")),
        );
        Ok(new_ids)
    }

    /// Merge two or more phases into one. Non-consecutive phases require
    /// `force` (the CLI prompts before passing it). The merged phase
    /// keeps the first participant's ID and concatenates everything else.
    pub fn merge(&mut self, phase_ids: &[String], force: bool) -> Result<String> {
        if phase_ids.len() < 2 {
            bail!("Merging needs at least 2 phases");
        }
        let mut indices = Vec::new();
        for id in phase_ids {
            indices.push(self.find(id)?);
        }
        let unique: BTreeSet<usize> = indices.iter().copied().collect();
        if unique.len() != indices.len() {
            bail!("Duplicate phase ids in merge");
        }

        let mut numbers: Vec<u32> = indices
            .iter()
            .map(|i| self.state.current_phases[*i].number)
            .collect();
        numbers.sort_unstable();
        let consecutive = numbers.windows(2).all(|w| w[1] == w[0] + 1);
        if !consecutive && !force {
            bail!(
                "Phases {} are not consecutive; pass force to merge anyway",
                phase_ids.join(", ")
            );
        }

        let mut merged = self.state.current_phases[indices[0]].clone();
        merged.merged_from = phase_ids.to_vec();
        merged.split_from = None;
        let mut titles = vec![merged.title.clone()];
        for id in &phase_ids[1..] {
            let idx = self.find(id)?;
            let part = self.state.current_phases[idx].clone();
            merged.files.extend(part.files);
            merged.plan.extend(part.plan);
            merged.verification.extend(part.verification);
            merged.acceptance_criteria.extend(part.acceptance_criteria);
            merged.rollback.extend(part.rollback);
            titles.push(part.title);
        }
        merged.title = titles.join(" + ");

        // Replace the first participant, drop the rest.
        let keep_idx = indices[0];
        self.state.current_phases[keep_idx] = merged;
        self.state
            .current_phases
            .retain(|p| p.id == phase_ids[0] || !phase_ids.contains(&p.id));
        self.renumber();

        let kept_id = phase_ids[0].clone();
        self.log(
            OpType::Merge,
            phase_ids.to_vec(),
            serde_yaml::Value::Null,
            format!("merged {} into {}", phase_ids.join(", "), kept_id),
        );
        Ok(kept_id)
    }

    /// Move a phase to a 1-indexed position.
    pub fn reorder(&mut self, phase_id: &str, new_position: usize) -> Result<()> {
        let count = self.state.current_phases.len();
        if new_position < 1 || new_position > count {
            bail!("Position {} out of range 1..{}", new_position, count);
        }
        let idx = self.find(phase_id)?;
        let phase = self.state.current_phases.remove(idx);
        self.state.current_phases.insert(new_position - 1, phase);
        self.renumber();
        self.log(
            OpType::Reorder,
            vec![phase_id.to_string()],
            serde_yaml::to_value(new_position).unwrap_or_default(),
            format!("moved {} to position {}", phase_id, new_position),
        );
        Ok(())
    }

    /// Mark a phase skipped without touching the phase list.
    pub fn skip(&mut self, phase_id: &str) -> Result<()> {
        self.find(phase_id)?;
        if !self.state.skipped_ids.insert(phase_id.to_string()) {
            bail!("Phase '{}' is already skipped", phase_id);
        }
        self.log(
            OpType::Skip,
            vec![phase_id.to_string()],
            serde_yaml::Value::Null,
            format!("skipped {}", phase_id),
        );
        Ok(())
    }

    pub fn unskip(&mut self, phase_id: &str) -> Result<()> {
        self.find(phase_id)?;
        if !self.state.skipped_ids.remove(phase_id) {
            bail!("Phase '{}' is not skipped", phase_id);
        }
        self.log(
            OpType::Unskip,
            vec![phase_id.to_string()],
            serde_yaml::Value::Null,
            format!("unskipped {}", phase_id),
        );
        Ok(())
    }

    /// Overwrite one field of a phase. Scalar fields take a string;
    /// list fields take a sequence.
    pub fn modify(&mut self, phase_id: &str, field: ModifyField, value: serde_yaml::Value) -> Result<()> {
        let idx = self.find(phase_id)?;
        let phase = &mut self.state.current_phases[idx];

        let as_string = |v: &serde_yaml::Value| -> Result<String> {
            v.as_str()
                .map(String::from)
                .ok_or_else(|| anyhow::anyhow!("field expects a string value"))
        };
        let as_list = |v: &serde_yaml::Value| -> Result<Vec<String>> {
            match v {
                serde_yaml::Value::Sequence(items) => items
                    .iter()
                    .map(|i| {
                        i.as_str()
                            .map(String::from)
                            .ok_or_else(|| anyhow::anyhow!("list items must be strings"))
                    })
                    .collect(),
                serde_yaml::Value::String(s) => Ok(vec![s.clone()]),
                _ => bail!("field expects a list value"),
            }
        };

        match field {
            ModifyField::Title => phase.title = as_string(&value)?,
            ModifyField::Context => phase.context = as_string(&value)?,
            ModifyField::Goal => phase.goal = as_string(&value)?,
            ModifyField::Plan => phase.plan = as_list(&value)?,
            ModifyField::Verification => phase.verification = as_list(&value)?,
            ModifyField::AcceptanceCriteria => phase.acceptance_criteria = as_list(&value)?,
            ModifyField::Rollback => phase.rollback = as_list(&value)?,
        }
        self.log(
            OpType::Modify,
            vec![phase_id.to_string()],
            value,
            format!("modified {:?} of {}", field, phase_id),
        );
        Ok(())
    }

    /// Reset everything (`scope = "all"`) or one phase.
    ///
    /// A full reset restores the original phases and clears both the
    /// skip set and the operation log — indistinguishable from a freshly
    /// opened session. A single-phase reset restores that phase from the
    /// original parse and records a reset op.
    pub fn reset(&mut self, scope: &str) -> Result<()> {
        if scope == "all" {
            self.state.current_phases = self.state.original_phases.clone();
            self.state.skipped_ids.clear();
            self.state.operations.clear();
            self.state.modified_at = crate::util::now_iso();
            return Ok(());
        }

        let original = self
            .state
            .original_phases
            .iter()
            .find(|p| p.id == scope)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No original phase with id '{}'", scope))?;
        let idx = self.find(scope)?;
        self.state.current_phases[idx] = original;
        self.renumber();
        self.log(
            OpType::Reset,
            vec![scope.to_string()],
            serde_yaml::Value::Null,
            format!("reset {} to its original form", scope),
        );
        Ok(())
    }

    /// Check the structural invariants; returns human-readable problems.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen = BTreeSet::new();
        for (idx, phase) in self.state.current_phases.iter().enumerate() {
            if !seen.insert(phase.id.clone()) {
                problems.push(format!("duplicate phase id '{}'", phase.id));
            }
            let expected = (idx + 1) as u32;
            if phase.number != expected {
                problems.push(format!(
                    "phase '{}' has number {}, expected {}",
                    phase.id, phase.number, expected
                ));
            }
            if phase.files.is_empty() {
                problems.push(format!("phase '{}' has no file changes", phase.id));
            }
        }
        problems
    }
}

/// 0 -> "a", 1 -> "b", ..., 25 -> "z", 26 -> "aa".
fn suffix_letters(mut n: usize) -> String {
    let mut out = String::new();
    loop {
        out.insert(0, (b'a' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{FileAction, FileChangeIntent};

    fn phase_with_files(number: u32, title: &str, files: usize) -> Phase {
        let mut phase = Phase::new(number, title);
        for i in 0..files {
            phase.files.push(FileChangeIntent {
                path: format!("src/file{}.rs", i),
                action: FileAction::Modify,
                description: String::new(),
                old_path: None,
            });
        }
        phase
    }

    fn three_phase_engine() -> NegotiationEngine {
        let phases = vec![
            phase_with_files(1, "First", 1),
            phase_with_files(2, "Second", 3),
            phase_with_files(3, "Third", 1),
        ];
        NegotiationEngine::new("audit.md", "# doc", phases)
    }

    fn ids(engine: &NegotiationEngine) -> Vec<String> {
        engine
            .state
            .current_phases
            .iter()
            .map(|p| p.id.clone())
            .collect()
    }

    #[test]
    fn test_split_preserves_ids_and_renumbers() {
        let mut engine = three_phase_engine();
        let new_ids = engine.split("phase-2", Some(vec![1, 2])).unwrap();
        assert_eq!(new_ids, vec!["phase-2a", "phase-2b", "phase-2c"]);
        assert_eq!(
            ids(&engine),
            vec!["phase-1", "phase-2a", "phase-2b", "phase-2c", "phase-3"]
        );
        let numbers: Vec<u32> = engine.state.current_phases.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        for id in &new_ids {
            let phase = engine
                .state
                .current_phases
                .iter()
                .find(|p| &p.id == id)
                .unwrap();
            assert_eq!(phase.split_from.as_deref(), Some("phase-2"));
            assert_eq!(phase.files.len(), 1);
        }
        assert!(engine.validate().is_empty());
    }

    #[test]
    fn test_split_default_is_per_file() {
        let mut engine = three_phase_engine();
        let new_ids = engine.split("phase-2", None).unwrap();
        assert_eq!(new_ids.len(), 3);
    }

    #[test]
    fn test_split_single_file_rejected() {
        let mut engine = three_phase_engine();
        let err = engine.split("phase-1", None).unwrap_err();
        assert!(err.to_string().contains("at least 2"));
    }

    #[test]
    fn test_split_invalid_indices_rejected() {
        let mut engine = three_phase_engine();
        assert!(engine.split("phase-2", Some(vec![0])).is_err());
        assert!(engine.split("phase-2", Some(vec![3])).is_err());
    }

    #[test]
    fn test_merge_consecutive() {
        let mut engine = three_phase_engine();
        let kept = engine
            .merge(&["phase-1".to_string(), "phase-2".to_string()], false)
            .unwrap();
        assert_eq!(kept, "phase-1");
        assert_eq!(ids(&engine), vec!["phase-1", "phase-2"]);
        let merged = &engine.state.current_phases[0];
        assert_eq!(merged.files.len(), 4);
        assert_eq!(
            merged.merged_from,
            vec!["phase-1".to_string(), "phase-2".to_string()]
        );
        // The old phase-3 is now number 2 and, being a plain id, renamed
        assert_eq!(engine.state.current_phases[1].number, 2);
        assert!(engine.validate().is_empty());
    }

    #[test]
    fn test_merge_non_consecutive_needs_force() {
        let mut engine = three_phase_engine();
        let err = engine
            .merge(&["phase-1".to_string(), "phase-3".to_string()], false)
            .unwrap_err();
        assert!(err.to_string().contains("not consecutive"));
        engine
            .merge(&["phase-1".to_string(), "phase-3".to_string()], true)
            .unwrap();
        assert_eq!(engine.state.current_phases.len(), 2);
    }

    #[test]
    fn test_reorder_moves_and_renumbers() {
        let mut engine = three_phase_engine();
        engine.reorder("phase-3", 1).unwrap();
        let titles: Vec<&str> = engine
            .state
            .current_phases
            .iter()
            .map(|p| p.title.as_str())
            .collect();
        assert_eq!(titles, vec!["Third", "First", "Second"]);
        assert!(engine.validate().is_empty());
    }

    #[test]
    fn test_reorder_out_of_range() {
        let mut engine = three_phase_engine();
        assert!(engine.reorder("phase-1", 0).is_err());
        assert!(engine.reorder("phase-1", 4).is_err());
    }

    #[test]
    fn test_skip_and_unskip_leave_list_untouched() {
        let mut engine = three_phase_engine();
        engine.skip("phase-2").unwrap();
        assert!(engine.state.skipped_ids.contains("phase-2"));
        assert_eq!(engine.state.current_phases.len(), 3);
        assert!(engine.skip("phase-2").is_err());
        engine.unskip("phase-2").unwrap();
        assert!(engine.state.skipped_ids.is_empty());
        assert!(engine.unskip("phase-2").is_err());
    }

    #[test]
    fn test_modify_scalar_and_list_fields() {
        let mut engine = three_phase_engine();
        engine
            .modify(
                "phase-1",
                ModifyField::Title,
                serde_yaml::Value::String("Renamed".to_string()),
            )
            .unwrap();
        engine
            .modify(
                "phase-1",
                ModifyField::Verification,
                serde_yaml::from_str("[\"cargo test\", \"cargo clippy\"]").unwrap(),
            )
            .unwrap();
        let phase = &engine.state.current_phases[0];
        assert_eq!(phase.title, "Renamed");
        assert_eq!(phase.verification, vec!["cargo test", "cargo clippy"]);
    }

    #[test]
    fn test_modify_type_mismatch() {
        let mut engine = three_phase_engine();
        let err = engine
            .modify(
                "phase-1",
                ModifyField::Plan,
                serde_yaml::Value::Number(5.into()),
            )
            .unwrap_err();
        assert!(err.to_string().contains("list"));
    }

    #[test]
    fn test_reset_all_matches_fresh_session() {
        let mut engine = three_phase_engine();
        engine.split("phase-2", None).unwrap();
        engine.skip("phase-1").unwrap();
        engine.reset("all").unwrap();

        let fresh = three_phase_engine();
        assert_eq!(engine.state.current_phases, fresh.state.current_phases);
        assert!(engine.state.skipped_ids.is_empty());
        assert!(engine.state.operations.is_empty());
    }

    #[test]
    fn test_reset_single_phase_logs_op() {
        let mut engine = three_phase_engine();
        engine
            .modify(
                "phase-1",
                ModifyField::Title,
                serde_yaml::Value::String("Changed".to_string()),
            )
            .unwrap();
        engine.reset("phase-1").unwrap();
        assert_eq!(engine.state.current_phases[0].title, "First");
        assert_eq!(engine.state.operations.len(), 2);
        assert_eq!(engine.state.operations[1].op_type, OpType::Reset);
    }

    #[test]
    fn test_operation_log_grows_append_only() {
        let mut engine = three_phase_engine();
        engine.skip("phase-1").unwrap();
        engine.unskip("phase-1").unwrap();
        engine.reorder("phase-3", 1).unwrap();
        let kinds: Vec<OpType> = engine.state.operations.iter().map(|o| o.op_type).collect();
        assert_eq!(kinds, vec![OpType::Skip, OpType::Unskip, OpType::Reorder]);
    }

    #[test]
    fn test_invariants_after_op_chains() {
        let mut engine = three_phase_engine();
        engine.split("phase-2", None).unwrap();
        engine
            .merge(&["phase-2a".to_string(), "phase-2b".to_string()], false)
            .unwrap();
        engine.reorder("phase-3", 1).unwrap();
        assert!(engine.validate().is_empty(), "{:?}", engine.validate());

        // No duplicate ids anywhere, numbers 1..N
        let id_set: BTreeSet<_> = ids(&engine).into_iter().collect();
        assert_eq!(id_set.len(), engine.state.current_phases.len());
    }

    #[test]
    fn test_split_then_resplit_suffixed_phase() {
        let mut engine = three_phase_engine();
        engine.split("phase-2", Some(vec![1])).unwrap(); // phase-2a (1 file), phase-2b (2 files)
        let new_ids = engine.split("phase-2b", None).unwrap();
        assert_eq!(new_ids, vec!["phase-2ba", "phase-2bb"]);
        assert!(engine.validate().is_empty());
    }

    #[test]
    fn test_suffix_letters_sequence() {
        assert_eq!(suffix_letters(0), "a");
        assert_eq!(suffix_letters(1), "b");
        assert_eq!(suffix_letters(25), "z");
        assert_eq!(suffix_letters(26), "aa");
        assert_eq!(suffix_letters(27), "ab");
    }
}
