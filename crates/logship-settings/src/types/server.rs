//! Server, store, agent and logging settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_PAGE_SIZE, DEFAULT_POOL_SIZE, DEFAULT_PORT, MAX_AGENT_ERRORS, RETRY_DELAY_MS};

/// HTTP server settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address, `host:port`.
    pub listen: String,
    /// Records per page when loading search results.
    pub page_size: usize,
    /// Persist the session table across restarts.
    pub persist_sessions: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{DEFAULT_PORT}"),
            page_size: DEFAULT_PAGE_SIZE,
            persist_sessions: true,
        }
    }
}

/// Record store settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Number of database handles held by the pool.
    pub pool_size: usize,
    /// Delay between retries of a busy/locked statement.
    pub retry_delay_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            retry_delay_ms: RETRY_DELAY_MS,
        }
    }
}

/// Which local log source the agent reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Journald,
    Syslog,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Journald => "journald",
            Self::Syslog => "syslog",
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "journald" | "journal" => Ok(Self::Journald),
            "syslog" => Ok(Self::Syslog),
            other => Err(format!("unknown log source {other:?}")),
        }
    }
}

/// Agent sync loop settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Base URL of the server, e.g. `http://logs.example:5102`.
    pub server_addr: String,
    /// Host name reported on registration. Empty means the system host name.
    pub hostname: String,
    pub source: SourceKind,
    /// Files read by the syslog source. Ignored by journald.
    pub paths: Vec<String>,
    /// Pause between sync cycles.
    pub sync_interval_ms: u64,
    /// Backoff after the n-th consecutive failure is
    /// `sync_interval + backoff_unit * n²`.
    pub backoff_unit_ms: u64,
    /// Consecutive submit failures before the loop gives up.
    pub max_errors: u32,
    /// Capacity of the channel between the source reader and the loop.
    pub queue_capacity: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            server_addr: format!("http://localhost:{DEFAULT_PORT}"),
            hostname: String::new(),
            source: SourceKind::default(),
            paths: vec!["/var/log/messages".to_string()],
            sync_interval_ms: 5_000,
            backoff_unit_ms: 1_000,
            max_errors: MAX_AGENT_ERRORS,
            queue_capacity: 256,
        }
    }
}

/// Log level for the subscriber filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to a tracing filter string.
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level for every target.
    pub level: LogLevel,
    /// Per-module overrides, e.g. `{"logship_store": "debug"}`.
    pub modules: BTreeMap<String, LogLevel>,
    /// Emit JSON lines on stdout instead of human-readable text.
    pub json: bool,
    /// Also append plain-text lines to this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            modules: BTreeMap::new(),
            json: false,
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_parses_loosely() {
        assert_eq!("Journald".parse::<SourceKind>(), Ok(SourceKind::Journald));
        assert_eq!("syslog".parse::<SourceKind>(), Ok(SourceKind::Syslog));
        assert!("eventlog".parse::<SourceKind>().is_err());
    }

    #[test]
    fn log_level_accepts_warning_alias() {
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(LogLevel::Warn.as_filter_str(), "warn");
    }

    #[test]
    fn agent_partial_json_keeps_defaults() {
        let a: AgentSettings =
            serde_json::from_str(r#"{"source": "syslog", "syncIntervalMs": 250}"#).unwrap();
        assert_eq!(a.source, SourceKind::Syslog);
        assert_eq!(a.sync_interval_ms, 250);
        assert_eq!(a.max_errors, MAX_AGENT_ERRORS);
        assert_eq!(a.backoff_unit_ms, 1_000);
    }

    #[test]
    fn module_levels_deserialize() {
        let l: LoggingSettings =
            serde_json::from_str(r#"{"modules": {"logship_store": "debug"}}"#).unwrap();
        assert_eq!(l.modules.get("logship_store"), Some(&LogLevel::Debug));
        assert_eq!(l.level, LogLevel::Info);
    }
}
