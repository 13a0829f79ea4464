use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use logship_settings::{LogLevel, LogshipSettings};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: LogLevel,
    /// Per-module level overrides (e.g. "logship_store" => debug).
    pub module_levels: Vec<(String, LogLevel)>,
    /// JSON lines on stdout instead of text.
    pub json: bool,
    /// Append plain-text output to this file as well.
    pub log_file: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            module_levels: Vec::new(),
            json: false,
            log_file: None,
        }
    }
}

impl TelemetryConfig {
    /// Derive the subscriber configuration from loaded settings.
    ///
    /// The log file is always enabled and lands in the base directory unless
    /// `logging.file` points elsewhere.
    pub fn from_settings(settings: &LogshipSettings) -> Self {
        Self {
            log_level: settings.logging.level,
            module_levels: settings
                .logging
                .modules
                .iter()
                .map(|(m, l)| (m.clone(), *l))
                .collect(),
            json: settings.logging.json,
            log_file: Some(settings.log_path()),
        }
    }

    /// `EnvFilter` directives, e.g. `info,logship_store=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.as_filter_str().to_string();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.as_filter_str()));
        }
        filter
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
}

/// Returned by [`init_telemetry`]; reports what was installed.
#[derive(Debug)]
pub struct TelemetryGuard {
    installed: bool,
    log_file: Option<PathBuf>,
}

impl TelemetryGuard {
    /// False when another subscriber was already active (e.g. a second
    /// call in the same test binary).
    pub fn installed(&self) -> bool {
        self.installed
    }

    pub fn log_file(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }
}

/// Initialize the telemetry subsystem.
///
/// Safe to call more than once: later calls leave the first subscriber in
/// place.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.filter_directives())?,
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let stdout_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };
    layers.push(stdout_layer);

    if let Some(path) = &config.log_file {
        let file = open_log_file(path)?;
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Arc::new(file))
                .boxed(),
        );
    }

    let installed = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(filter = %config.filter_directives(), json = config.json, "telemetry initialised");
    }

    Ok(TelemetryGuard {
        installed,
        log_file: config.log_file.clone(),
    })
}

fn open_log_file(path: &Path) -> Result<File, TelemetryError> {
    let wrap = |source| TelemetryError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(wrap)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(wrap)
}
