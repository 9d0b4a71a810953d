//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{QuorumSettings, TransportMode};

/// `$QUORUM_CONFIG` if set, otherwise `./quorum.json`.
pub fn settings_path() -> PathBuf {
    read_env_string("QUORUM_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("quorum.json"))
}

/// Load settings from the default path with env var overrides, then validate.
pub fn load_settings() -> Result<QuorumSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides, then validate.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<QuorumSettings> {
    let defaults = serde_json::to_value(QuorumSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: QuorumSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `QUORUM_*` environment overrides. Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut QuorumSettings) {
    if let Some(v) = read_env_string("QUORUM_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("QUORUM_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string("QUORUM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("QUORUM_LOG_JSON") {
        settings.logging.json = v;
    }
    if let Some(v) = read_env_u64("QUORUM_ALLOCATE_TIMEOUT_MS", 0, 600_000) {
        settings.pool.allocate_timeout_ms = v;
    }
    if let Some(v) = read_env_bool("QUORUM_AUTO_PROVISION") {
        settings.pool.auto_provision = v;
    }
    if let Some(v) = read_env_u64("QUORUM_SESSION_TIMEOUT_MS", 100, 3_600_000) {
        settings.session.timeout_ms = v;
    }
    if let Some(v) = read_env_string("QUORUM_TRANSPORT") {
        match parse_transport_mode(&v) {
            Some(mode) => settings.transport.mode = mode,
            None => tracing::warn!(key = "QUORUM_TRANSPORT", value = %v, "invalid transport mode, ignoring"),
        }
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_transport_mode(val: &str) -> Option<TransportMode> {
    match val.to_lowercase().as_str() {
        "local" => Some(TransportMode::Local),
        "http" => Some(TransportMode::Http),
        _ => None,
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
