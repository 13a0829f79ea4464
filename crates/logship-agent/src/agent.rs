//! The sync loop: read new records from the local source and ship them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use logship_core::time::epoch;
use logship_core::Record;
use logship_settings::LogshipSettings;
use reqwest::Url;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::client::ServerClient;
use crate::cookies::SavedSession;
use crate::error::AgentError;
use crate::source::LogSource;

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub server: Url,
    pub hostname: String,
    pub sync_interval: Duration,
    pub backoff_unit: Duration,
    pub max_errors: u32,
    pub queue_capacity: usize,
    /// Where the session cookie and host id are kept between runs.
    pub cookie_jar: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_settings(settings: &LogshipSettings) -> Result<Self, AgentError> {
        let agent = &settings.agent;
        let server = Url::parse(&agent.server_addr)
            .map_err(|e| AgentError::Config(format!("server address {:?}: {e}", agent.server_addr)))?;
        let hostname = if agent.hostname.trim().is_empty() {
            system_hostname()
        } else {
            agent.hostname.trim().to_owned()
        };

        Ok(Self {
            server,
            hostname,
            sync_interval: Duration::from_millis(agent.sync_interval_ms),
            backoff_unit: Duration::from_millis(agent.backoff_unit_ms),
            max_errors: agent.max_errors,
            queue_capacity: agent.queue_capacity.max(1),
            cookie_jar: Some(settings.cookie_jar_path()),
        })
    }

    /// Pause after the `errors`-th consecutive failure.
    pub fn backoff(&self, errors: u32) -> Duration {
        self.sync_interval
            .saturating_add(self.backoff_unit.saturating_mul(errors.saturating_mul(errors)))
    }
}

/// Host name from the kernel, falling back to `$HOSTNAME`.
pub fn system_hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .chain(std::env::var("HOSTNAME").ok())
        .map(|h| h.trim().to_owned())
        .find(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncState {
    Unregistered,
    Registering,
    Syncing { watermark: DateTime<Utc> },
    Idle { backoff: Duration },
    Stopped,
    Fatal(String),
}

struct StopSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` or until raised, whichever comes first.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.notify.notified() => {}
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    client: ServerClient,
    source: Option<Box<dyn LogSource>>,
    host_id: Option<i64>,
    registered: bool,
    watermark: DateTime<Utc>,
    errors: u32,
    stop: Arc<StopSignal>,
    state: watch::Sender<SyncState>,
}

impl Agent {
    /// Build an agent, restoring a saved session from the cookie jar.
    pub fn new(config: AgentConfig, source: Box<dyn LogSource>) -> Result<Self, AgentError> {
        let client = ServerClient::new(config.server.clone())?;

        let mut host_id = None;
        if let Some(saved) = config.cookie_jar.as_deref().and_then(SavedSession::load) {
            if saved.restore(client.jar(), client.base()) {
                info!(host_id = saved.host_id, "restored saved session");
                host_id = Some(saved.host_id);
            }
        }

        let (state, _) = watch::channel(SyncState::Unregistered);
        Ok(Self {
            config,
            client,
            source: Some(source),
            host_id,
            registered: false,
            watermark: epoch(),
            errors: 0,
            stop: Arc::new(StopSignal {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            state,
        })
    }

    pub fn host_id(&self) -> Option<i64> {
        self.host_id
    }

    /// Time of the newest record known to be on the server.
    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.errors
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Ask the loop to end before its next cycle.
    pub fn stop(&self) {
        self.stop.raise();
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    /// Register with the server and fetch the resume watermark.
    ///
    /// A failed watermark query is not an error; the agent then resumes
    /// from the epoch and lets the server drop what it already has.
    #[instrument(skip(self), fields(hostname = %self.config.hostname))]
    pub async fn register(&mut self) -> Result<i64, AgentError> {
        self.set_state(SyncState::Registering);
        self.registered = false;

        let id = self.client.register(&self.config.hostname, self.host_id).await?;
        self.host_id = Some(id);
        self.registered = true;
        self.persist_session(id);

        let resume = match self.client.most_recent().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "most recent query failed, resuming from epoch");
                epoch()
            }
        };
        self.watermark = self.watermark.max(resume);
        info!(host_id = id, watermark = %self.watermark, "registered");
        Ok(id)
    }

    fn persist_session(&self, host_id: i64) {
        let Some(path) = &self.config.cookie_jar else {
            return;
        };
        match SavedSession::capture(self.client.jar(), self.client.base(), host_id) {
            Some(saved) => {
                if let Err(e) = saved.save(path) {
                    warn!(path = %path.display(), error = %e, "failed to save cookie jar");
                }
            }
            None => warn!("server set no session cookie"),
        }
    }

    /// Read everything new from the source and submit it as one batch.
    ///
    /// Returns the number of records submitted. The watermark only moves
    /// after the server accepted the batch.
    pub async fn sync_once(&mut self) -> Result<usize, AgentError> {
        self.set_state(SyncState::Syncing {
            watermark: self.watermark,
        });

        let batch = self.read_batch().await?;
        let Some(newest) = batch.iter().map(|r| r.time).max() else {
            debug!("nothing new to submit");
            return Ok(0);
        };

        let added = self.client.submit(&batch).await?;
        self.watermark = self.watermark.max(newest);
        info!(submitted = batch.len(), added, watermark = %self.watermark, "batch shipped");
        Ok(batch.len())
    }

    async fn read_batch(&mut self) -> Result<Vec<Record>, AgentError> {
        let mut source = self
            .source
            .take()
            .ok_or_else(|| AgentError::Config("log source lost after a failed read".into()))?;

        let (tx, mut rx) = mpsc::channel(self.config.queue_capacity);
        let begin = self.watermark;
        let producer = tokio::task::spawn_blocking(move || {
            source.read_from(begin, tx);
            source
        });

        let mut batch = Vec::new();
        while let Some(record) = rx.recv().await {
            batch.push(record);
        }

        let source = producer.await.map_err(std::io::Error::other)?;
        if let Some(e) = source.error() {
            warn!(error = %e, "log source reported an error");
        }
        self.source = Some(source);
        Ok(batch)
    }

    /// Run until stopped or until too many consecutive failures.
    pub async fn run(mut self) -> Result<(), AgentError> {
        if let Some(source) = self.source.as_mut() {
            if let Err(e) = source.init() {
                error!(error = %e, "log source failed to initialise");
                self.set_state(SyncState::Fatal(e.to_string()));
                return Err(e.into());
            }
        }
        info!(server = %self.config.server, hostname = %self.config.hostname, "agent started");

        while !self.stop.is_raised() {
            let outcome = if self.registered {
                self.sync_once().await
            } else {
                self.register().await.map(|_| 0)
            };

            let pause = match outcome {
                Ok(_) => {
                    self.errors = 0;
                    self.config.sync_interval
                }
                Err(e) => {
                    if e.needs_registration() {
                        self.registered = false;
                    }
                    self.errors += 1;
                    warn!(error = %e, errors = self.errors, "sync cycle failed");
                    if self.errors >= self.config.max_errors {
                        let fatal = AgentError::Fatal {
                            errors: self.errors,
                            last: e.to_string(),
                        };
                        error!(error = %fatal, "agent giving up");
                        self.set_state(SyncState::Fatal(e.to_string()));
                        self.close_source();
                        return Err(fatal);
                    }
                    self.config.backoff(self.errors)
                }
            };

            if self.stop.is_raised() {
                break;
            }
            self.set_state(SyncState::Idle { backoff: pause });
            self.stop.pause(pause).await;
        }

        self.close_source();
        self.set_state(SyncState::Stopped);
        info!(watermark = %self.watermark, "agent stopped");
        Ok(())
    }

    fn close_source(&mut self) {
        if let Some(source) = self.source.as_mut() {
            if let Err(e) = source.close() {
                warn!(error = %e, "failed to close log source");
            }
        }
    }

    /// Run the loop on the runtime.
    pub fn spawn(self) -> AgentHandle {
        let stop = Arc::clone(&self.stop);
        let state = self.subscribe();
        AgentHandle {
            stop,
            state,
            task: tokio::spawn(self.run()),
        }
    }
}

/// Control of a spawned [`Agent`].
pub struct AgentHandle {
    stop: Arc<StopSignal>,
    state: watch::Receiver<SyncState>,
    task: JoinHandle<Result<(), AgentError>>,
}

impl AgentHandle {
    pub fn stop(&self) {
        self.stop.raise();
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Wait until the state satisfies `f`.
    pub async fn wait_for(&mut self, f: impl FnMut(&SyncState) -> bool) -> SyncState {
        if let Ok(state) = self.state.wait_for(f).await {
            return state.clone();
        }
        self.state()
    }

    /// Wait for the loop to end. Must not be awaited again once it has
    /// returned.
    pub async fn join(&mut self) -> Result<(), AgentError> {
        (&mut self.task).await.map_err(std::io::Error::other)?
    }
}
