//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If `~/.relay/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `RELAY_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{ApiKey, RelaySettings};

/// `~/.relay`, or `$RELAY_HOME` when set.
pub fn relay_home() -> PathBuf {
    if let Some(dir) = read_env_string("RELAY_HOME") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay")
}

pub fn settings_path() -> PathBuf {
    relay_home().join("settings.json")
}

pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, nulls in
/// `source` are skipped.
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

/// Apply `RELAY_*` overrides. Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    if let Some(v) = read_env_string("RELAY_APPROVED_DIRECTORY") {
        settings.approved_directory = PathBuf::from(v);
    }
    if let Some(v) = read_env_string("RELAY_CLI_PATH") {
        settings.cli_path = v;
    }
    if let Some(v) = read_env_string("RELAY_MODEL") {
        settings.model = Some(v);
    }
    if let Some(v) = read_env_u64("RELAY_MAX_TURNS", 1, 1_000) {
        settings.max_turns = v as u32;
    }
    if let Some(v) = read_env_u64("RELAY_TIMEOUT_SECONDS", 1, 86_400) {
        settings.timeout_seconds = v;
    }
    if let Some(v) = read_env_bool("RELAY_USE_STRUCTURED_BACKEND") {
        settings.use_structured_backend = v;
    }
    if let Some(v) = read_env_string("RELAY_ALLOWED_TOOLS") {
        settings.allowed_tools = parse_tool_list(&v);
    }
    if let Some(v) = read_env_string("RELAY_DISALLOWED_TOOLS") {
        settings.disallowed_tools = parse_tool_list(&v);
    }
    if let Some(v) = read_env_f64("RELAY_MAX_COST_PER_USER", 0.0, 1_000_000.0) {
        settings.max_cost_per_user = v;
    }
    if let Some(v) = read_env_u64("RELAY_SESSION_TIMEOUT_HOURS", 1, 8_760) {
        settings.session_timeout_hours = v;
    }
    if let Some(v) = read_env_u64("RELAY_MAX_SESSIONS_PER_USER", 1, 1_000) {
        settings.max_sessions_per_user = v as usize;
    }
    if let Some(v) = read_env_string("RELAY_LOG_LEVEL") {
        settings.log_level = v;
    }
    if let Some(v) = read_env_string("RELAY_DATABASE_PATH") {
        settings.database_path = PathBuf::from(v);
    }
    if let Some(v) = read_env_bool("RELAY_PERSIST_LOGS") {
        settings.persist_logs = v;
    }

    if let Some(key) = read_env_string("RELAY_API_KEY").or_else(|| read_env_string("ANTHROPIC_API_KEY")) {
        settings.api_key = Some(ApiKey(SecretString::from(key)));
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.trim().parse().ok()?;
    (n.is_finite() && n >= min && n <= max).then_some(n)
}

/// Comma-separated tool names; blanks dropped.
pub fn parse_tool_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Env var readers ─────────────────────────────────────────────────────────

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

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
    }
    result
}

fn read_env_f64(name: &str, min: f64, max: f64) -> Option<f64> {
    let val = std::env::var(name).ok()?;
    let result = parse_f64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid number env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    #[test]
    fn merge_simple_override() {
        let merged = deep_merge(
            serde_json::json!({"a": 1, "b": 2}),
            serde_json::json!({"a": 10}),
        );
        assert_eq!(merged["a"], 10);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(
            serde_json::json!({"allowed_tools": ["Read", "Write"]}),
            serde_json::json!({"allowed_tools": ["Bash"]}),
        );
        assert_eq!(merged["allowed_tools"], serde_json::json!(["Bash"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(
            serde_json::json!({"a": 1}),
            serde_json::json!({"a": null}),
        );
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.max_turns, RelaySettings::default().max_turns);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"max_turns": 25, "allowed_tools": ["Read", "Grep"], "use_structured_backend": false}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.max_turns, 25);
        assert_eq!(settings.allowed_tools, vec!["Read", "Grep"]);
        assert!(!settings.use_structured_backend);
        assert_eq!(settings.session_timeout_hours, 24);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn api_key_in_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"api_key": "sk-from-file"}"#).unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        // Only the environment may supply a key.
        if std::env::var("RELAY_API_KEY").is_err() && std::env::var("ANTHROPIC_API_KEY").is_err() {
            assert!(settings.api_key.is_none());
        }
    }

    #[test]
    fn parse_bool_values() {
        for v in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "Off"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("10", 1, 100), Some(10));
        assert_eq!(parse_u64_range("0", 1, 100), None);
        assert_eq!(parse_u64_range("abc", 1, 100), None);
        assert_eq!(parse_f64_range("2.5", 0.0, 10.0), Some(2.5));
        assert_eq!(parse_f64_range("-1", 0.0, 10.0), None);
        assert_eq!(parse_f64_range("NaN", 0.0, 10.0), None);
    }

    #[test]
    fn parse_tool_list_trims_and_drops_blanks() {
        assert_eq!(parse_tool_list("Read, Write,,Bash ,"), vec!["Read", "Write", "Bash"]);
        assert!(parse_tool_list("").is_empty());
    }
}
