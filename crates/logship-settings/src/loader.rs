//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LogshipSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `LOGSHIP_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{default_base_dir, LogshipSettings};

pub const ENV_BASE_DIR: &str = "LOGSHIP_BASE_DIR";

/// Load settings for a process.
///
/// `base_dir` (from the command line) wins over `LOGSHIP_BASE_DIR`, which wins
/// over `~/.logship.d`. The settings file is `config` when given, else
/// `settings.json` inside the base directory.
pub fn load_settings(base_dir: Option<&Path>, config: Option<&Path>) -> Result<LogshipSettings> {
    let explicit_base = resolve_base_dir(base_dir, |name| std::env::var(name).ok());
    let root = explicit_base.clone().unwrap_or_else(default_base_dir);
    let path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.join("settings.json"));

    let mut settings = load_settings_from_path(&path)?;
    if let Some(base) = explicit_base {
        settings.base_dir = base;
    }
    Ok(settings)
}

/// The base directory chosen explicitly, by flag or by `LOGSHIP_BASE_DIR`.
/// An empty variable counts as unset.
pub fn resolve_base_dir(
    base_dir: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<PathBuf> {
    let env = EnvReader { lookup };
    base_dir
        .map(Path::to_path_buf)
        .or_else(|| env.string(ENV_BASE_DIR).map(PathBuf::from))
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<LogshipSettings> {
    let defaults = serde_json::to_value(LogshipSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: LogshipSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    validate(&settings)?;
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
/// Invalid values are logged and ignored, leaving the file/default value.
pub fn apply_env_overrides(settings: &mut LogshipSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string(ENV_BASE_DIR) {
        settings.base_dir = PathBuf::from(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.parsed("LOGSHIP_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("LOGSHIP_LOG_JSON") {
        settings.logging.json = v;
    }

    // ── Server / store ──────────────────────────────────────────────
    if let Some(v) = env.string("LOGSHIP_LISTEN") {
        settings.server.listen = v;
    }
    if let Some(v) = env.usize_range("LOGSHIP_POOL_SIZE", 1, 256) {
        settings.store.pool_size = v;
    }

    // ── Agent ───────────────────────────────────────────────────────
    if let Some(v) = env.string("LOGSHIP_SERVER_ADDR") {
        settings.agent.server_addr = v;
    }
    if let Some(v) = env.parsed("LOGSHIP_LOG_SOURCE") {
        settings.agent.source = v;
    }
    if let Some(v) = env.string("LOGSHIP_LOG_PATH") {
        settings.agent.paths = v.split(':').filter(|p| !p.is_empty()).map(str::to_string).collect();
    }
    if let Some(v) = env.u64_range("LOGSHIP_SYNC_INTERVAL", 10, 86_400_000) {
        settings.agent.sync_interval_ms = v;
    }
}

/// Reject settings no component can run with.
pub fn validate(settings: &LogshipSettings) -> Result<()> {
    if settings.store.pool_size == 0 {
        return Err(SettingsError::InvalidValue("store.poolSize must be at least 1".into()));
    }
    if settings.server.page_size == 0 {
        return Err(SettingsError::InvalidValue("server.pageSize must be at least 1".into()));
    }
    if settings.agent.max_errors == 0 {
        return Err(SettingsError::InvalidValue("agent.maxErrors must be at least 1".into()));
    }
    if settings.agent.queue_capacity == 0 {
        return Err(SettingsError::InvalidValue("agent.queueCapacity must be at least 1".into()));
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64_range(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize_range(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = self.string(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        let val = self.string(name)?;
        let result = val.parse().ok();
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "unrecognised env var value, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogLevel, SourceKind};
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "server": {"listen": "0.0.0.0:5102", "pageSize": 100}
        });
        let source = serde_json::json!({
            "server": {"listen": "127.0.0.1:9000"}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["listen"], "127.0.0.1:9000");
        assert_eq!(merged["server"]["pageSize"], 100);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"paths": ["/a", "/b"]});
        let source = serde_json::json!({"paths": ["/c"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["paths"], serde_json::json!(["/c"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        let defaults = LogshipSettings::default();
        assert_eq!(settings.store, defaults.store);
        assert_eq!(settings.agent.max_errors, defaults.agent.max_errors);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"store": {"poolSize": 8}, "agent": {"source": "syslog", "paths": ["/var/log/syslog"]}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.store.pool_size, 8);
        assert_eq!(settings.store.retry_delay_ms, crate::RETRY_DELAY_MS);
        assert_eq!(settings.agent.source, SourceKind::Syslog);
        assert_eq!(settings.agent.paths, vec!["/var/log/syslog".to_string()]);
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
    fn load_rejects_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"store": {"poolSize": 0}}"#).unwrap();

        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }

    #[test]
    fn explicit_base_dir_finds_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.json"),
            r#"{"server": {"listen": "127.0.0.1:7777"}}"#,
        )
        .unwrap();

        let settings = load_settings(Some(dir.path()), None).unwrap();
        assert_eq!(settings.base_dir, dir.path());
        assert_eq!(settings.server.listen, "127.0.0.1:7777");
    }

    #[test]
    fn base_dir_flag_beats_env() {
        let lookup = env(&[("LOGSHIP_BASE_DIR", "/srv/env")]);
        assert_eq!(
            resolve_base_dir(Some(Path::new("/srv/flag")), &lookup),
            Some(PathBuf::from("/srv/flag"))
        );
        assert_eq!(resolve_base_dir(None, &lookup), Some(PathBuf::from("/srv/env")));
        assert_eq!(resolve_base_dir(None, env(&[("LOGSHIP_BASE_DIR", "")])), None);
        assert_eq!(resolve_base_dir(None, env(&[])), None);
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut s = LogshipSettings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("LOGSHIP_BASE_DIR", "/srv/ls"),
                ("LOGSHIP_LOG_LEVEL", "debug"),
                ("LOGSHIP_LISTEN", "127.0.0.1:1"),
                ("LOGSHIP_POOL_SIZE", "2"),
                ("LOGSHIP_SERVER_ADDR", "http://collector:5102"),
                ("LOGSHIP_LOG_SOURCE", "syslog"),
                ("LOGSHIP_LOG_PATH", "/var/log/a:/var/log/b"),
                ("LOGSHIP_SYNC_INTERVAL", "2500"),
            ]),
        );
        assert_eq!(s.base_dir, PathBuf::from("/srv/ls"));
        assert_eq!(s.logging.level, LogLevel::Debug);
        assert_eq!(s.server.listen, "127.0.0.1:1");
        assert_eq!(s.store.pool_size, 2);
        assert_eq!(s.agent.server_addr, "http://collector:5102");
        assert_eq!(s.agent.source, SourceKind::Syslog);
        assert_eq!(s.agent.paths, vec!["/var/log/a".to_string(), "/var/log/b".to_string()]);
        assert_eq!(s.agent.sync_interval_ms, 2500);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = LogshipSettings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("LOGSHIP_POOL_SIZE", "0"),
                ("LOGSHIP_LOG_LEVEL", "loud"),
                ("LOGSHIP_LOG_SOURCE", ""),
            ]),
        );
        let d = LogshipSettings::default();
        assert_eq!(s.store.pool_size, d.store.pool_size);
        assert_eq!(s.logging.level, d.logging.level);
        assert_eq!(s.agent.source, d.agent.source);
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in &["true", "1", "yes", "on", "TRUE"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in &["false", "0", "no", "off", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("1000", 1000, 600_000), Some(1000));
        assert_eq!(parse_u64_range("500", 1000, 600_000), None);
        assert_eq!(parse_u64_range("abc", 1000, 600_000), None);
        assert_eq!(parse_usize_range("4", 1, 256), Some(4));
        assert_eq!(parse_usize_range("0", 1, 256), None);
    }
}
