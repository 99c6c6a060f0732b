//! Shared utility functions for the Phaser crate.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Format a timestamp as ISO-8601 with millisecond precision and a trailing Z.
/// This is the wire format for every persisted timestamp.
pub fn iso_millis(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Current UTC time in the wire format.
pub fn now_iso() -> String {
    iso_millis(Utc::now())
}

/// Turn an arbitrary title into a filesystem/branch-safe slug:
/// lowercase, alphanumeric runs joined by single hyphens.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut prev_hyphen = true;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            prev_hyphen = false;
        } else if !prev_hyphen {
            slug.push('-');
            prev_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Truncate command output for event payloads. Keeps the head of the
/// output; appends a marker when anything was dropped.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.chars().count() <= max_chars {
        return output.to_string();
    }
    let truncated: String = output.chars().take(max_chars).collect();
    format!("{}... (truncated)", truncated)
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Short (first 8 hex chars) SHA-256, used for session and branch-name suffixes.
pub fn short_hash(bytes: &[u8]) -> String {
    sha256_hex(bytes)[..8].to_string()
}
