//! Server-side agent sessions, keyed by the token in the session cookie.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use dashmap::DashMap;
use logship_core::SessionToken;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "logship_session";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub status: String,
    /// Host bound by a successful registration; zero before that.
    pub host: i64,
}

impl Session {
    pub fn bound(host: i64) -> Self {
        Self {
            status: "ok".into(),
            host,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.status == "ok" && self.host > 0
    }
}

/// Concurrent session map, optionally mirrored to a JSON file.
pub struct SessionStore {
    sessions: DashMap<SessionToken, Session>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl SessionStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            sessions: DashMap::new(),
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Load sessions from `path`, starting empty if the file is missing.
    ///
    /// A corrupt file is logged and ignored; it is overwritten on the next
    /// change.
    pub fn load(path: &Path) -> io::Result<Self> {
        let store = Self {
            path: Some(path.to_owned()),
            ..Self::in_memory()
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(store),
            Err(e) => return Err(e),
        };
        match serde_json::from_str::<BTreeMap<String, Session>>(&raw) {
            Ok(saved) => {
                for (token, session) in saved {
                    let _ = store.sessions.insert(SessionToken::from_raw(token), session);
                }
                info!(path = %path.display(), count = store.len(), "sessions restored");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "ignoring corrupt session file"),
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, token: &SessionToken) -> Option<Session> {
        self.sessions.get(token).map(|s| s.value().clone())
    }

    /// Bind `token` to `host`, replacing any earlier binding.
    ///
    /// Writes the session file when one is configured; call it from a
    /// blocking context.
    pub fn bind(&self, token: &SessionToken, host: i64) {
        let _ = self.sessions.insert(token.clone(), Session::bound(host));
        debug!(host, "session bound");
        self.persist();
    }

    pub fn remove(&self, token: &SessionToken) -> Option<Session> {
        let removed = self.sessions.remove(token).map(|(_, s)| s);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Host id of a bound session found in `jar`.
    pub fn host_for(&self, jar: &CookieJar) -> Option<i64> {
        let token = token_from(jar)?;
        self.get(&token).filter(Session::is_bound).map(|s| s.host)
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.write_lock.lock();
        let snapshot: BTreeMap<String, Session> = self
            .sessions
            .iter()
            .map(|e| (e.key().to_string(), e.value().clone()))
            .collect();
        if let Err(e) = write_atomic(path, &snapshot) {
            warn!(path = %path.display(), error = %e, "failed to persist sessions");
        }
    }
}

fn write_atomic(path: &Path, sessions: &BTreeMap<String, Session>) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    let raw = serde_json::to_vec_pretty(sessions)?;
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)
}

/// The session token carried by the request, if any.
pub fn token_from(jar: &CookieJar) -> Option<SessionToken> {
    jar.get(SESSION_COOKIE)
        .map(|c| SessionToken::from_raw(c.value()))
        .filter(SessionToken::is_well_formed)
}

/// Reuse the request's token or mint a fresh one, setting the cookie.
pub fn ensure_token(jar: CookieJar) -> (CookieJar, SessionToken) {
    if let Some(token) = token_from(&jar) {
        return (jar, token);
    }
    let token = SessionToken::new();
    let cookie = Cookie::build((SESSION_COOKIE, token.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax);
    (jar.add(cookie), token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_lookup() {
        let store = SessionStore::in_memory();
        let token = SessionToken::new();
        assert!(store.get(&token).is_none());

        store.bind(&token, 7);
        assert_eq!(store.get(&token), Some(Session::bound(7)));
        assert_eq!(store.remove(&token).map(|s| s.host), Some(7));
        assert!(store.is_empty());
    }

    #[test]
    fn sessions_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let token = SessionToken::new();

        SessionStore::load(&path).unwrap().bind(&token, 3);

        let reloaded = SessionStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(&token).map(|s| s.host), Some(3));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(SessionStore::load(&path).unwrap().is_empty());
    }

    #[test]
    fn ensure_token_reuses_cookie() {
        let (jar, first) = ensure_token(CookieJar::new());
        assert!(first.is_well_formed());
        let (_, second) = ensure_token(jar);
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_cookie_is_ignored() {
        let jar = CookieJar::new().add(Cookie::new(SESSION_COOKIE, "forged"));
        assert!(token_from(&jar).is_none());
        let store = SessionStore::in_memory();
        assert!(store.host_for(&jar).is_none());
    }

    #[test]
    fn unbound_session_has_no_host() {
        let store = SessionStore::in_memory();
        let (jar, token) = ensure_token(CookieJar::new());
        let _ = store.sessions.insert(token.clone(), Session { status: "ok".into(), host: 0 });
        assert!(store.host_for(&jar).is_none());
        store.bind(&token, 5);
        assert_eq!(store.host_for(&jar), Some(5));
    }
}
