//! Schema migrations for store files.
//!
//! Every store file carries a top-level `version` integer. On read, a
//! record older than [`CURRENT_VERSION`] is upgraded in memory through the
//! registered migration chain; the upgraded form is persisted on the next
//! write. Additive fields never bump the version; migrations are one-way
//! and idempotent.

use serde_json::Value;

/// Current schema version for all versioned store files.
pub const CURRENT_VERSION: u32 = 1;

/// The store files that participate in versioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Audits,
    Events,
    Replays,
}

/// Upgrade a parsed store file to the current schema version.
///
/// Returns the (possibly rewritten) value and whether anything changed.
/// A file whose version is already current passes through untouched; a
/// missing version field is treated as version 0.
pub fn upgrade(kind: FileKind, mut value: Value) -> (Value, bool) {
    let mut version = value
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let mut changed = false;

    while version < CURRENT_VERSION {
        value = migrate_step(kind, version, value);
        version += 1;
        changed = true;
    }

    if changed
        && let Some(obj) = value.as_object_mut()
    {
        obj.insert("version".to_string(), Value::from(CURRENT_VERSION));
    }
    (value, changed)
}

/// One migration step: `version` → `version + 1`.
fn migrate_step(kind: FileKind, version: u32, mut value: Value) -> Value {
    match (kind, version) {
        // Version 0 predates the versioned wrapper: a bare list of records.
        (FileKind::Audits, 0) => wrap_bare_list(&mut value, "audits"),
        (FileKind::Events, 0) => wrap_bare_list(&mut value, "events"),
        (FileKind::Replays, 0) => wrap_bare_list(&mut value, "replays"),
        _ => {}
    }
    value
}

fn wrap_bare_list(value: &mut Value, field: &str) {
    if value.is_array() {
        let list = std::mem::replace(value, Value::Null);
        let mut obj = serde_json::Map::new();
        obj.insert(field.to_string(), list);
        *value = Value::Object(obj);
    } else if let Some(obj) = value.as_object_mut()
        && !obj.contains_key(field)
    {
        obj.insert(field.to_string(), Value::Array(Vec::new()));
    }
}
