//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`MoverSettings::default()`]
//! 2. If `~/.mover/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `MOVER_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::MoverSettings;

/// Resolve the path to the settings file (`~/.mover/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".mover").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<MoverSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid resulting
/// value is an error.
pub fn load_settings_from_path(path: &Path) -> Result<MoverSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<MoverSettings> {
    let defaults = serde_json::to_value(MoverSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and the file/default value kept.
pub fn apply_env_overrides(settings: &mut MoverSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("MOVER_TICK_PERIOD_MS") {
        match parse_u64_range(&v, 1, 10_000) {
            Some(n) => settings.animation.tick_period_ms = n,
            None => warn_invalid("MOVER_TICK_PERIOD_MS", &v),
        }
    }
    if let Some(v) = read("MOVER_START_DELAY_MS") {
        match parse_u64_range(&v, 0, 600_000) {
            Some(n) => settings.animation.start_delay_ms = n,
            None => warn_invalid("MOVER_START_DELAY_MS", &v),
        }
    }
    if let Some(v) = read("MOVER_FINISH_BUFFER_TICKS") {
        match v.parse::<f64>().ok().filter(|f| f.is_finite()) {
            Some(f) => settings.animation.finish_buffer_ticks = f,
            None => warn_invalid("MOVER_FINISH_BUFFER_TICKS", &v),
        }
    }
    if let Some(v) = read("MOVER_DEFAULT_DURATION_TICKS") {
        match v.parse::<u32>() {
            Ok(n) => settings.animation.default_duration_ticks = n,
            Err(_) => warn_invalid("MOVER_DEFAULT_DURATION_TICKS", &v),
        }
    }
    if let Some(v) = read("MOVER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("MOVER_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => warn_invalid("MOVER_LOG_JSON", &v),
        }
    }
}

fn warn_invalid(key: &str, value: &str) {
    tracing::warn!(key, value, "invalid env override, ignoring");
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
