//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file only needs the fields it changes.

mod server;

pub use server::*;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Root settings for both the agent and the server.
///
/// ```json
/// {
///   "baseDir": "/var/lib/logship",
///   "server": { "listen": "0.0.0.0:5102" },
///   "agent": { "source": "syslog", "paths": ["/var/log/messages"] }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogshipSettings {
    /// Directory holding the database, log file, sessions and cookie jar.
    pub base_dir: PathBuf,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub server: ServerSettings,
    pub agent: AgentSettings,
}

impl Default for LogshipSettings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            logging: LoggingSettings::default(),
            store: StoreSettings::default(),
            server: ServerSettings::default(),
            agent: AgentSettings::default(),
        }
    }
}

impl LogshipSettings {
    /// Defaults rooted at `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join("logship.db")
    }

    /// The configured log file, or `logship.log` under the base directory.
    pub fn log_path(&self) -> PathBuf {
        match &self.logging.file {
            Some(f) => resolve(&self.base_dir, f),
            None => self.base_dir.join("logship.log"),
        }
    }

    pub fn session_store_path(&self) -> PathBuf {
        self.base_dir.join("sessions.json")
    }

    pub fn cookie_jar_path(&self) -> PathBuf {
        self.base_dir.join("cookiejar.json")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.base_dir.join("settings.json")
    }
}

/// `~/.logship.d`, or `/tmp/.logship.d` without a home directory.
pub fn default_base_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".logship.d")
}

fn resolve(base: &Path, p: &str) -> PathBuf {
    let path = Path::new(p);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_base_dir() {
        let s = LogshipSettings::with_base_dir("/srv/logship");
        assert_eq!(s.database_path(), PathBuf::from("/srv/logship/logship.db"));
        assert_eq!(s.log_path(), PathBuf::from("/srv/logship/logship.log"));
        assert_eq!(s.session_store_path(), PathBuf::from("/srv/logship/sessions.json"));
        assert_eq!(s.cookie_jar_path(), PathBuf::from("/srv/logship/cookiejar.json"));
    }

    #[test]
    fn relative_log_file_is_under_base_dir() {
        let mut s = LogshipSettings::with_base_dir("/srv/logship");
        s.logging.file = Some("debug.log".into());
        assert_eq!(s.log_path(), PathBuf::from("/srv/logship/debug.log"));
        s.logging.file = Some("/var/log/logship.log".into());
        assert_eq!(s.log_path(), PathBuf::from("/var/log/logship.log"));
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(LogshipSettings::default()).unwrap();
        assert!(json.get("baseDir").is_some());
        assert!(json["store"].get("poolSize").is_some());
        assert!(json["agent"].get("syncIntervalMs").is_some());
    }
}
