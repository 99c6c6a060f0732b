//! Configuration for Phaser.
//!
//! Configuration lives in `config.yaml` inside the store root as a nested
//! map. Reads deep-merge the file over built-in defaults, so a partial file
//! only overrides the keys it names. Writes go through dotted-key paths
//! (`phaser config set events.retention_days 30`).
//!
//! # Configuration File Format
//!
//! ```yaml
//! manifest:
//!   exclude: ["dist", "*.generated.ts"]
//!   max_file_bytes: 10485760
//!   max_total_bytes: 104857600
//! events:
//!   max_events: 10000
//!   retention_days: 90
//! engine:
//!   retries: 3
//!   verification_timeout_secs: 60
//! branch:
//!   base: main
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Manifest capture settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Extra exclude patterns on top of the built-in set.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Files larger than this are recorded without content.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Capture aborts if the total size would exceed this.
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_total_bytes() -> u64 {
    100 * 1024 * 1024
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            max_total_bytes: default_max_total_bytes(),
        }
    }
}

/// Event-log retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Hard cap on retained events; oldest beyond the cap are pruned.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Events older than this many days are pruned by `clear_events`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_max_events() -> usize {
    10_000
}

fn default_retention_days() -> u32 {
    90
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            retention_days: default_retention_days(),
        }
    }
}

/// Phase-engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Verification retries per phase before marking it failed.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Deadline for each verification command.
    #[serde(default = "default_verification_timeout_secs")]
    pub verification_timeout_secs: u64,
}

fn default_retries() -> u32 {
    3
}

fn default_verification_timeout_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            verification_timeout_secs: default_verification_timeout_secs(),
        }
    }
}

/// Branch-mode settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Override for the base branch; current branch when unset.
    #[serde(default)]
    pub base: Option<String>,
}

/// The complete configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaserConfig {
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub branch: BranchConfig,
}

impl PhaserConfig {
    /// Parse a config document, deep-merging it over the defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let user: Value = serde_yaml::from_str(content).context("Failed to parse config.yaml")?;
        let mut base =
            serde_yaml::to_value(Self::default()).context("Failed to serialize default config")?;
        deep_merge(&mut base, &user);
        serde_yaml::from_value(base).context("Invalid value in config.yaml")
    }

    /// Serialize the config tree for persistence.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config")
    }
}

/// Recursively overlay `overlay` onto `base`. Maps merge key-by-key;
/// every other value type replaces wholesale.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Set a dotted key (`events.retention_days`) in a YAML tree, creating
/// intermediate maps as needed. The value string is parsed as YAML so
/// numbers, booleans and lists come through typed.
pub fn set_dotted(root: &mut Value, dotted_key: &str, raw_value: &str) -> Result<()> {
    let parsed: Value = serde_yaml::from_str(raw_value)
        .with_context(|| format!("Failed to parse value '{}'", raw_value))?;

    let segments: Vec<&str> = dotted_key.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        anyhow::bail!("Invalid config key '{}'", dotted_key);
    }

    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        if !matches!(current, Value::Mapping(_)) {
            *current = Value::Mapping(serde_yaml::Mapping::new());
        }
        let Value::Mapping(map) = current else {
            unreachable!()
        };
        let key = Value::String((*segment).to_string());
        current = map
            .entry(key)
            .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
    }

    let last = Value::String(segments[segments.len() - 1].to_string());
    if !matches!(current, Value::Mapping(_)) {
        *current = Value::Mapping(serde_yaml::Mapping::new());
    }
    let Value::Mapping(map) = current else {
        unreachable!()
    };
    map.insert(last, parsed);
    Ok(())
}
