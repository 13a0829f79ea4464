use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use logship_settings::LogshipSettings;
use logship_store::Pool;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers;
use crate::session::SessionStore;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// `host:port`; port 0 binds an ephemeral port.
    pub listen: String,
    pub page_size: i64,
    /// File the session store is mirrored to; `None` keeps sessions in
    /// memory only.
    pub session_store: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", logship_settings::DEFAULT_PORT),
            page_size: logship_settings::DEFAULT_PAGE_SIZE as i64,
            session_store: None,
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &LogshipSettings) -> Self {
        Self {
            listen: settings.server.listen.clone(),
            page_size: i64::try_from(settings.server.page_size).unwrap_or(i64::MAX),
            session_store: settings
                .server
                .persist_sessions
                .then(|| settings.session_store_path()),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub sessions: Arc<SessionStore>,
    pub page_size: i64,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let agent = Router::new()
        .route("/init/{hostname}", get(handlers::register))
        .route("/most_recent", get(handlers::most_recent))
        .route("/submit_records", post(handlers::submit_records));

    let ajax = Router::new()
        .route("/search/create", post(handlers::search_create))
        .route("/search/load/{id}/{page}", get(handlers::search_load))
        .route("/search/list", get(handlers::search_list))
        .route("/search/delete/{id}", get(handlers::search_delete))
        .route("/hosts", get(handlers::hosts))
        .route("/sources", get(handlers::sources))
        .route("/records/recent/{cnt}", get(handlers::recent_records));

    Router::new()
        .nest("/ws", agent)
        .nest("/ajax", ajax)
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listen address and serve in the background.
pub async fn start(config: ServerConfig, pool: Arc<Pool>) -> Result<ServerHandle, std::io::Error> {
    let sessions = match &config.session_store {
        Some(path) => SessionStore::load(path)?,
        None => SessionStore::in_memory(),
    };

    let state = AppState {
        pool,
        sessions: Arc::new(sessions),
        page_size: config.page_size,
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    let local_addr = listener.local_addr()?;

    info!(addr = %local_addr, "logship server started");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %e, "server stopped with an error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        server,
    })
}

/// Handle returned by [`start`]. Dropping it shuts the server down.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Base URL for clients on this machine.
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.addr.port())
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.server).await {
            warn!(error = %e, "server task failed");
        }
        info!(addr = %self.addr, "logship server stopped");
    }
}
