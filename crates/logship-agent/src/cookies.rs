//! Persistence of the agent's session cookie and assigned host id.

use std::io;
use std::path::Path;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What the agent remembers between runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSession {
    pub server_url: String,
    /// `Cookie` header value as sent to the server.
    pub cookie: String,
    pub host_id: i64,
}

impl SavedSession {
    /// Read the jar file. A missing or unreadable file yields `None`.
    pub fn load(path: &Path) -> Option<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read cookie jar");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(saved) => Some(saved),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt cookie jar");
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), host_id = self.host_id, "cookie jar saved");
        Ok(())
    }

    /// Snapshot the cookies `jar` would send to `url`.
    pub fn capture(jar: &Jar, url: &Url, host_id: i64) -> Option<Self> {
        let header = jar.cookies(url)?;
        let cookie = header.to_str().ok()?.to_owned();
        Some(Self {
            server_url: url.to_string(),
            cookie,
            host_id,
        })
    }

    /// Put the saved cookies back into `jar`. Only applies when the session
    /// was saved for `url`.
    pub fn restore(&self, jar: &Jar, url: &Url) -> bool {
        if self.server_url != url.as_str() {
            debug!(saved = %self.server_url, current = %url, "cookie jar is for another server");
            return false;
        }
        for pair in self.cookie.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            jar.add_cookie_str(&format!("{pair}; Path=/"), url);
        }
        true
    }
}
