//! Local log sources the agent reads from.

mod journald;
mod syslog;

pub use journald::JournaldSource;
pub use syslog::SyslogFileSource;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use logship_core::Record;
use logship_settings::SourceKind;
use thiserror::Error;
use tokio::sync::mpsc::Sender;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}")]
    Exit { command: String, status: String },

    #[error("invalid line pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("no log files configured")]
    NoPaths,
}

/// A producer of log records.
///
/// Reads are blocking; the agent runs them on the blocking pool.
pub trait LogSource: Send {
    fn kind(&self) -> SourceKind;

    /// Prepare for reading. Called once before the first read.
    fn init(&mut self) -> Result<(), SourceError>;

    fn close(&mut self) -> Result<(), SourceError>;

    /// Send every available record with `time >= begin`, then return.
    /// Dropping `tx` on return closes the channel.
    ///
    /// Failures are not returned; they are kept for [`error`](Self::error)
    /// so the records read before the failure still reach the caller.
    fn read_from(&mut self, begin: DateTime<Utc>, tx: Sender<Record>);

    /// The error that ended the most recent read, if any.
    fn error(&self) -> Option<&SourceError>;
}

/// Build the source selected in the settings.
pub fn open_source(kind: SourceKind, paths: &[String]) -> Result<Box<dyn LogSource>, SourceError> {
    match kind {
        SourceKind::Journald => Ok(Box::new(JournaldSource::new())),
        SourceKind::Syslog => {
            let paths: Vec<PathBuf> = paths.iter().map(PathBuf::from).collect();
            Ok(Box::new(SyslogFileSource::new(paths)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_selects_variant() {
        let journal = open_source(SourceKind::Journald, &[]).unwrap();
        assert_eq!(journal.kind(), SourceKind::Journald);

        let syslog = open_source(SourceKind::Syslog, &["/var/log/messages".into()]).unwrap();
        assert_eq!(syslog.kind(), SourceKind::Syslog);
    }

    #[test]
    fn syslog_requires_paths() {
        assert!(matches!(
            open_source(SourceKind::Syslog, &[]),
            Err(SourceError::NoPaths)
        ));
    }
}
