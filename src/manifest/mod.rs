//! Content-addressed directory snapshots.
//!
//! A manifest records every file under a root: relative path, size,
//! executable bit, SHA-256, and (for text files) the decoded content.
//! Capture is deterministic — entries are sorted by path — so two
//! captures of identical trees serialize identically.

pub mod diff;

pub use diff::{ChangeType, DiffResult, FileChange, compare};

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directory names never captured, regardless of configuration.
const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    ".audit",
    ".phaser",
];

/// Extensions always classified as binary.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "pdf", "zip", "tar", "gz", "exe", "dll", "so", "dylib",
    "woff", "woff2", "ttf", "eot",
];

/// How many leading bytes are scanned for NUL when classifying.
const CLASSIFY_PREFIX_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Text,
    Binary,
}

/// One captured file. Field order is the on-disk YAML key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub size: u64,
    /// `None` when the file could not be read.
    pub sha256: Option<String>,
    /// Decoded content; recorded only for readable text entries within
    /// the size cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub is_executable: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unreadable: bool,
}

/// A deterministic snapshot of a directory tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub root: String,
    pub timestamp: String,
    pub file_count: usize,
    pub total_size_bytes: u64,
    pub files: Vec<FileEntry>,
}

impl Manifest {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize manifest")
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse manifest")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        crate::store::lock::write_locked(path, &self.to_yaml()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn entry(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Capture settings, usually derived from store configuration.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Extra exclude patterns (globs over relative paths).
    pub exclude: Vec<String>,
    /// Files above this size are recorded without content.
    pub max_file_bytes: u64,
    /// Capture aborts if total size would exceed this.
    pub max_total_bytes: u64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        let config = crate::config::ManifestConfig::default();
        Self {
            exclude: config.exclude,
            max_file_bytes: config.max_file_bytes,
            max_total_bytes: config.max_total_bytes,
        }
    }
}

impl CaptureOptions {
    pub fn from_config(config: &crate::config::ManifestConfig) -> Self {
        Self {
            exclude: config.exclude.clone(),
            max_file_bytes: config.max_file_bytes,
            max_total_bytes: config.max_total_bytes,
        }
    }
}

/// Capture a manifest of `root`.
///
/// Follows gitignore when `root` is inside a git work tree, always skips
/// the built-in directory set plus configured excludes, skips broken
/// symlinks with a warning, and flags unreadable files rather than
/// failing the whole capture.
pub fn capture(root: &Path, options: &CaptureOptions) -> Result<Manifest> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve capture root {}", root.display()))?;

    let patterns: Vec<glob::Pattern> = options
        .exclude
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!("invalid exclude pattern '{}': {}", p, e);
                None
            }
        })
        .collect();

    let repo = git2::Repository::discover(&root).ok();

    // Sequential walk collects candidates; hashing happens in parallel below.
    let mut candidates: Vec<(PathBuf, String)> = Vec::new();
    let mut total_size: u64 = 0;

    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.file_type().is_dir() {
                let name = entry.file_name().to_string_lossy();
                if DEFAULT_EXCLUDED_DIRS.contains(&name.as_ref()) {
                    return false;
                }
            }
            true
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            if entry.path_is_symlink() && std::fs::metadata(entry.path()).is_err() {
                tracing::warn!("skipping broken symlink {}", entry.path().display());
            }
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(&root)
            .expect("walkdir yields paths under root")
            .to_string_lossy()
            .replace('\\', "/");

        if patterns.iter().any(|p| p.matches(&rel)) {
            continue;
        }
        if let Some(repo) = &repo
            && repo.status_should_ignore(entry.path()).unwrap_or(false)
        {
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        total_size += size;
        if total_size > options.max_total_bytes {
            anyhow::bail!(
                "Capture of {} aborted: total size exceeds {} bytes; raise manifest.max_total_bytes or add excludes",
                root.display(),
                options.max_total_bytes
            );
        }
        candidates.push((entry.path().to_path_buf(), rel));
    }

    let mut files: Vec<FileEntry> = candidates
        .par_iter()
        .map(|(abs, rel)| read_entry(abs, rel, options.max_file_bytes))
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let total_size_bytes = files.iter().map(|f| f.size).sum();
    Ok(Manifest {
        root: root.to_string_lossy().to_string(),
        timestamp: crate::util::now_iso(),
        file_count: files.len(),
        total_size_bytes,
        files,
    })
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn extension_is_binary(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| BINARY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn read_entry(abs: &Path, rel: &str, max_file_bytes: u64) -> FileEntry {
    let executable = is_executable(abs);
    let bytes = match std::fs::read(abs) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("unreadable file {}: {}", rel, e);
            let size = std::fs::metadata(abs).map(|m| m.len()).unwrap_or(0);
            return FileEntry {
                path: rel.to_string(),
                entry_type: if extension_is_binary(rel) {
                    EntryType::Binary
                } else {
                    EntryType::Text
                },
                size,
                sha256: None,
                content: None,
                is_executable: executable,
                unreadable: true,
            };
        }
    };

    let size = bytes.len() as u64;
    let sha256 = Some(crate::util::sha256_hex(&bytes));

    let prefix = &bytes[..bytes.len().min(CLASSIFY_PREFIX_BYTES)];
    let binary = extension_is_binary(rel) || prefix.contains(&0u8);

    let (entry_type, content) = if binary {
        (EntryType::Binary, None)
    } else {
        match String::from_utf8(bytes) {
            Ok(text) if size <= max_file_bytes => (EntryType::Text, Some(text)),
            Ok(_) => (EntryType::Text, None),
            Err(_) => (EntryType::Binary, None),
        }
    };

    FileEntry {
        path: rel.to_string(),
        entry_type,
        size,
        sha256,
        content,
        is_executable: executable,
        unreadable: false,
    }
}
