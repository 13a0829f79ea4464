use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use logship_agent::{open_source, Agent, AgentConfig};
use logship_server::ServerConfig;
use logship_settings::{LogshipSettings, SourceKind};
use logship_store::Pool;
use logship_telemetry::{init_telemetry, TelemetryConfig};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "logship", version, about = "Ship syslog and journald records to a central store")]
struct Cli {
    /// Directory for the database, log file and session state.
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Settings file to read instead of `<base-dir>/settings.json`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept records from agents and serve searches.
    Server {
        /// Address to listen on, e.g. `0.0.0.0:5102`.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Read the local log source and submit new records.
    Agent {
        /// Server base URL, e.g. `http://logs.example:5102`.
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        source: Option<SourceKind>,
        /// Syslog file to read; may be repeated.
        #[arg(long = "path")]
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = logship_settings::load_settings(cli.base_dir.as_deref(), cli.config.as_deref())
        .context("failed to load settings")?;
    apply_cli(&mut settings, &cli.command);

    std::fs::create_dir_all(&settings.base_dir)
        .with_context(|| format!("cannot create {}", settings.base_dir.display()))?;
    let _telemetry = init_telemetry(&TelemetryConfig::from_settings(&settings))
        .context("failed to initialise logging")?;

    match cli.command {
        Command::Server { .. } => run_server(&settings).await,
        Command::Agent { .. } => run_agent(&settings).await,
    }
}

fn apply_cli(settings: &mut LogshipSettings, command: &Command) {
    match command {
        Command::Server { listen } => {
            if let Some(listen) = listen {
                settings.server.listen = listen.clone();
            }
        }
        Command::Agent {
            server,
            source,
            paths,
        } => {
            if let Some(server) = server {
                settings.agent.server_addr = server.clone();
            }
            if let Some(source) = source {
                settings.agent.source = *source;
            }
            if !paths.is_empty() {
                settings.agent.paths = paths.clone();
            }
        }
    }
}

async fn run_server(settings: &LogshipSettings) -> Result<()> {
    let db_path = settings.database_path();
    let pool = Pool::open_with_retry(
        &db_path,
        settings.store.pool_size,
        Duration::from_millis(settings.store.retry_delay_ms),
    )
    .with_context(|| format!("cannot open database {}", db_path.display()))?;

    let handle = logship_server::start(ServerConfig::from_settings(settings), Arc::new(pool))
        .await
        .with_context(|| format!("cannot listen on {}", settings.server.listen))?;
    info!(addr = %handle.addr, db = %db_path.display(), "server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn run_agent(settings: &LogshipSettings) -> Result<()> {
    let config = AgentConfig::from_settings(settings)?;
    let source = open_source(settings.agent.source, &settings.agent.paths)
        .with_context(|| format!("cannot open {} source", settings.agent.source.as_str()))?;

    let mut handle = Agent::new(config, source)?.spawn();
    let finished = tokio::select! {
        res = handle.join() => Some(res),
        _ = tokio::signal::ctrl_c() => None,
    };
    let outcome = match finished {
        Some(res) => res,
        None => {
            info!("stopping agent");
            handle.stop();
            handle.join().await
        }
    };

    if let Err(e) = &outcome {
        error!(error = %e, "agent ended");
    }
    Ok(outcome?)
}
