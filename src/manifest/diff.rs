//! Change computation between two manifests.

use super::{EntryType, FileEntry, Manifest};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::BTreeMap;

/// Unified diffs are only computed when both sides are at most this big.
const DIFF_SIZE_LIMIT: u64 = 100 * 1024;

/// Marker recorded when a text diff was skipped for size.
pub const DIFF_SKIPPED_MARKER: &str = "(diff skipped: file too large)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// One changed file between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_size: Option<u64>,
    /// Unified diff lines for text changes; `Some(vec![])` marks a
    /// permission-only change; `None` for binary or added/deleted files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_lines: Option<Vec<String>>,
}

/// Disjoint change sets between a before and an after manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub added: Vec<FileChange>,
    pub modified: Vec<FileChange>,
    pub deleted: Vec<FileChange>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

/// Compare two manifests. The three result lists are disjoint by
/// construction: each path lands in exactly one bucket.
pub fn compare(before: &Manifest, after: &Manifest) -> DiffResult {
    let before_map: BTreeMap<&str, &FileEntry> =
        before.files.iter().map(|f| (f.path.as_str(), f)).collect();
    let after_map: BTreeMap<&str, &FileEntry> =
        after.files.iter().map(|f| (f.path.as_str(), f)).collect();

    let mut result = DiffResult::default();

    for (path, entry) in &after_map {
        if !before_map.contains_key(path) {
            result.added.push(FileChange {
                path: (*path).to_string(),
                change_type: ChangeType::Added,
                before_hash: None,
                after_hash: entry.sha256.clone(),
                before_size: None,
                after_size: Some(entry.size),
                diff_lines: None,
            });
        }
    }

    for (path, entry) in &before_map {
        if !after_map.contains_key(path) {
            result.deleted.push(FileChange {
                path: (*path).to_string(),
                change_type: ChangeType::Deleted,
                before_hash: entry.sha256.clone(),
                after_hash: None,
                before_size: Some(entry.size),
                after_size: None,
                diff_lines: None,
            });
        }
    }

    for (path, before_entry) in &before_map {
        let Some(after_entry) = after_map.get(path) else {
            continue;
        };
        let content_changed = before_entry.sha256 != after_entry.sha256;
        let mode_changed = before_entry.is_executable != after_entry.is_executable;
        if !content_changed && !mode_changed {
            continue;
        }

        let diff_lines = if !content_changed {
            // Permission-only change
            Some(Vec::new())
        } else {
            text_diff_lines(path, before_entry, after_entry)
        };

        result.modified.push(FileChange {
            path: (*path).to_string(),
            change_type: ChangeType::Modified,
            before_hash: before_entry.sha256.clone(),
            after_hash: after_entry.sha256.clone(),
            before_size: Some(before_entry.size),
            after_size: Some(after_entry.size),
            diff_lines,
        });
    }

    result
}

fn text_diff_lines(
    path: &str,
    before: &FileEntry,
    after: &FileEntry,
) -> Option<Vec<String>> {
    if before.entry_type != EntryType::Text || after.entry_type != EntryType::Text {
        return None;
    }
    if before.size > DIFF_SIZE_LIMIT || after.size > DIFF_SIZE_LIMIT {
        return Some(vec![DIFF_SKIPPED_MARKER.to_string()]);
    }
    let (Some(before_content), Some(after_content)) = (&before.content, &after.content) else {
        return Some(vec![DIFF_SKIPPED_MARKER.to_string()]);
    };

    let diff = TextDiff::from_lines(before_content.as_str(), after_content.as_str());
    let unified = diff
        .unified_diff()
        .header(&format!("a/{}", path), &format!("b/{}", path))
        .to_string();
    Some(unified.lines().map(String::from).collect())
}
