//! Agent against a live server: registration, resume, dedup and failure
//! handling.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{DateTime, Utc};
use logship_agent::{Agent, AgentConfig, AgentError, LogSource, SourceError, SyncState};
use logship_core::time::from_unix;
use logship_core::Record;
use logship_server::{start, ServerConfig, ServerHandle};
use logship_settings::SourceKind;
use logship_store::Pool;
use reqwest::Url;
use tokio::sync::mpsc::Sender;

/// In-memory source whose contents the test can extend.
#[derive(Clone, Default)]
struct MemorySource {
    records: Arc<Mutex<Vec<Record>>>,
}

impl MemorySource {
    fn with_times(times: &[i64]) -> Self {
        let src = Self::default();
        src.push(times);
        src
    }

    fn push(&self, times: &[i64]) {
        let mut records = self.records.lock().unwrap();
        for &t in times {
            records.push(Record::new(from_unix(t), "app", format!("event at {t}")));
        }
    }
}

impl LogSource for MemorySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Syslog
    }

    fn init(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn read_from(&mut self, begin: DateTime<Utc>, tx: Sender<Record>) {
        let records = self.records.lock().unwrap().clone();
        for r in records.into_iter().filter(|r| r.time >= begin) {
            if tx.blocking_send(r).is_err() {
                return;
            }
        }
    }

    fn error(&self) -> Option<&SourceError> {
        None
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    server: ServerHandle,
}

async fn serve() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let pool = Pool::open(&dir.path().join("logship.db"), 4).unwrap();
    let config = ServerConfig {
        listen: "127.0.0.1:0".into(),
        ..Default::default()
    };
    let server = start(config, Arc::new(pool)).await.unwrap();
    Fixture { dir, server }
}

fn config(server: &str, hostname: &str) -> AgentConfig {
    AgentConfig {
        server: Url::parse(server).unwrap(),
        hostname: hostname.into(),
        sync_interval: Duration::from_millis(20),
        backoff_unit: Duration::from_millis(1),
        max_errors: 5,
        queue_capacity: 2,
        cookie_jar: None,
    }
}

#[tokio::test]
async fn web01_ships_and_resumes() {
    let fx = serve().await;
    let source = MemorySource::with_times(&[100, 101, 102]);
    let mut agent = Agent::new(config(&fx.server.url(), "web01"), Box::new(source.clone())).unwrap();

    let id = agent.register().await.unwrap();
    assert_eq!(agent.watermark(), from_unix(0));

    assert_eq!(agent.sync_once().await.unwrap(), 3);
    assert_eq!(agent.watermark(), from_unix(102));

    // Nothing new: the record at the watermark is re-read and deduplicated.
    assert_eq!(agent.sync_once().await.unwrap(), 1);
    assert_eq!(agent.watermark(), from_unix(102));

    // A fresh agent for the same host resumes from the server's watermark.
    let mut again = Agent::new(config(&fx.server.url(), "web01"), Box::new(source)).unwrap();
    assert_eq!(again.register().await.unwrap(), id);
    assert_eq!(again.watermark(), from_unix(102));
}

#[tokio::test]
async fn empty_batches_leave_the_watermark() {
    let fx = serve().await;
    let mut agent = Agent::new(config(&fx.server.url(), "idle01"), Box::new(MemorySource::default())).unwrap();
    agent.register().await.unwrap();
    assert_eq!(agent.sync_once().await.unwrap(), 0);
    assert_eq!(agent.watermark(), from_unix(0));
}

#[tokio::test]
async fn mismatched_reregistration_is_rejected() {
    let fx = serve().await;
    let url = fx.server.url();

    let mut web01 = Agent::new(config(&url, "web01"), Box::new(MemorySource::default())).unwrap();
    let web01_id = web01.register().await.unwrap();

    let mut web02 = Agent::new(config(&url, "web02"), Box::new(MemorySource::default())).unwrap();
    web02.register().await.unwrap();

    // Claim web01's id under another name.
    let client = logship_agent::ServerClient::new(Url::parse(&url).unwrap()).unwrap();
    assert_matches!(
        client.register("web02", Some(web01_id)).await,
        Err(AgentError::Rejected { status: 200, .. })
    );
}

#[tokio::test]
async fn submit_without_session_needs_registration() {
    let fx = serve().await;
    let mut agent = Agent::new(config(&fx.server.url(), "web01"), Box::new(MemorySource::with_times(&[1]))).unwrap();
    let err = agent.sync_once().await.unwrap_err();
    assert!(err.needs_registration(), "{err}");
    assert_eq!(agent.watermark(), from_unix(0));
}

#[tokio::test]
async fn loop_ships_new_records_until_stopped() {
    let fx = serve().await;
    let source = MemorySource::with_times(&[10, 20]);
    let agent = Agent::new(config(&fx.server.url(), "web01"), Box::new(source.clone())).unwrap();
    let mut handle = agent.spawn();

    handle
        .wait_for(|s| matches!(s, SyncState::Syncing { watermark } if *watermark == from_unix(20)))
        .await;
    source.push(&[30]);
    handle
        .wait_for(|s| matches!(s, SyncState::Syncing { watermark } if *watermark == from_unix(30)))
        .await;

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn unreachable_server_is_fatal() {
    // Grab a free port and release it so nothing listens there.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut cfg = config(&format!("http://127.0.0.1:{port}"), "web01");
    cfg.max_errors = 2;
    let agent = Agent::new(cfg, Box::new(MemorySource::default())).unwrap();
    let mut handle = agent.spawn();

    assert_matches!(
        tokio::time::timeout(Duration::from_secs(30), handle.join()).await.unwrap(),
        Err(AgentError::Fatal { errors: 2, .. })
    );
}

#[tokio::test]
async fn session_is_saved_and_restored() {
    let fx = serve().await;
    let jar = fx.dir.path().join("cookiejar.json");
    let mut cfg = config(&fx.server.url(), "web01");
    cfg.cookie_jar = Some(jar.clone());

    let mut first = Agent::new(cfg.clone(), Box::new(MemorySource::default())).unwrap();
    let id = first.register().await.unwrap();
    assert!(jar.exists());

    // The restored cookie is enough to talk to the server without
    // registering again.
    let mut second = Agent::new(cfg, Box::new(MemorySource::with_times(&[5]))).unwrap();
    assert_eq!(second.host_id(), Some(id));
    assert_eq!(second.sync_once().await.unwrap(), 1);
}
