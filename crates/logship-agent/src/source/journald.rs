use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use chrono::{DateTime, Utc};
use logship_core::Record;
use logship_settings::SourceKind;
use serde_json::Value;
use tokio::sync::mpsc::Sender;
use tracing::{debug, trace, warn};

use super::{LogSource, SourceError};

const JOURNALCTL: &str = "journalctl";

/// Reads the systemd journal through `journalctl --output=json`.
pub struct JournaldSource {
    command: String,
    last_error: Option<SourceError>,
}

impl Default for JournaldSource {
    fn default() -> Self {
        Self::new()
    }
}

impl JournaldSource {
    pub fn new() -> Self {
        Self::with_command(JOURNALCTL)
    }

    /// Use another executable that speaks the `journalctl` interface.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            last_error: None,
        }
    }

    fn spawn_error(&self, source: std::io::Error) -> SourceError {
        SourceError::Spawn {
            command: self.command.clone(),
            source,
        }
    }

    fn run(&self, begin: DateTime<Utc>, tx: &Sender<Record>) -> Result<usize, SourceError> {
        let mut child = Command::new(&self.command)
            .arg("--output=json")
            .arg("--no-pager")
            .arg(format!("--since=@{}", begin.timestamp()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(self.spawn_error(std::io::Error::other("stdout not captured")));
        };

        let outcome = stream_entries(BufReader::new(stdout), begin, tx);
        // Reap the child on every path; it is killed unless it ran to the end.
        if !matches!(outcome, Ok((_, false))) {
            let _ = child.kill();
        }
        let status = child.wait().map_err(|e| self.spawn_error(e))?;
        let (sent, receiver_gone) = outcome.map_err(|e| self.spawn_error(e))?;
        if !status.success() && !receiver_gone {
            return Err(SourceError::Exit {
                command: self.command.clone(),
                status: status.to_string(),
            });
        }
        Ok(sent)
    }
}

/// Forward entries newer than `begin`. Returns how many were sent and
/// whether the receiver went away.
fn stream_entries(
    mut reader: impl BufRead,
    begin: DateTime<Utc>,
    tx: &Sender<Record>,
) -> std::io::Result<(usize, bool)> {
    let mut sent = 0usize;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok((sent, false));
        }
        let line = String::from_utf8_lossy(&buf);
        let Some(record) = parse_entry(line.trim_end()) else {
            trace!(line = %line, "skipping journal entry");
            continue;
        };
        if record.time < begin {
            continue;
        }
        if tx.blocking_send(record).is_err() {
            return Ok((sent, true));
        }
        sent += 1;
    }
}

/// Map one JSON journal entry to a record.
///
/// `MESSAGE` may be a byte array when the payload is not valid UTF-8.
pub fn parse_entry(line: &str) -> Option<Record> {
    let entry: Value = serde_json::from_str(line).ok()?;

    let micros: i64 = entry.get("__REALTIME_TIMESTAMP")?.as_str()?.parse().ok()?;
    let time = DateTime::from_timestamp_micros(micros)?;

    let source = ["SYSLOG_IDENTIFIER", "_COMM"]
        .iter()
        .find_map(|key| entry.get(*key).and_then(Value::as_str))
        .unwrap_or("unknown");

    let message = match entry.get("MESSAGE")? {
        Value::String(s) => s.clone(),
        Value::Array(bytes) => {
            let raw: Vec<u8> = bytes
                .iter()
                .filter_map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            String::from_utf8_lossy(&raw).into_owned()
        }
        _ => return None,
    };

    Some(Record::new(time, source, message))
}

impl LogSource for JournaldSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Journald
    }

    fn init(&mut self) -> Result<(), SourceError> {
        let status = Command::new(&self.command)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| self.spawn_error(e))?;
        if !status.success() {
            return Err(SourceError::Exit {
                command: self.command.clone(),
                status: status.to_string(),
            });
        }
        debug!(command = %self.command, "journald source ready");
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn read_from(&mut self, begin: DateTime<Utc>, tx: Sender<Record>) {
        self.last_error = None;
        match self.run(begin, &tx) {
            Ok(sent) => debug!(sent, "journal read"),
            Err(e) => {
                warn!(error = %e, "journal read failed");
                self.last_error = Some(e);
            }
        }
    }

    fn error(&self) -> Option<&SourceError> {
        self.last_error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tokio::sync::mpsc;

    fn fake_journalctl(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("journalctl");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn drain(src: &mut JournaldSource, begin: DateTime<Utc>) -> Vec<Record> {
        let (tx, mut rx) = mpsc::channel(2);
        std::thread::scope(|s| {
            let consumer = s.spawn(move || {
                let mut out = Vec::new();
                while let Some(r) = rx.blocking_recv() {
                    out.push(r);
                }
                out
            });
            src.read_from(begin, tx);
            consumer.join().unwrap()
        })
    }

    #[test]
    fn entry_with_identifier() {
        let r = parse_entry(
            r#"{"__REALTIME_TIMESTAMP":"1700000000500000","SYSLOG_IDENTIFIER":"sshd","_COMM":"sshd-session","MESSAGE":"hello"}"#,
        )
        .unwrap();
        assert_eq!(r.time.timestamp(), 1_700_000_000);
        assert_eq!(r.time.timestamp_subsec_millis(), 500);
        assert_eq!(r.source, "sshd");
        assert_eq!(r.message, "hello");
    }

    #[test]
    fn entry_falls_back_to_comm_and_decodes_bytes() {
        let r = parse_entry(
            r#"{"__REALTIME_TIMESTAMP":"1000000","_COMM":"kworker","MESSAGE":[104,105]}"#,
        )
        .unwrap();
        assert_eq!(r.source, "kworker");
        assert_eq!(r.message, "hi");
    }

    #[test]
    fn incomplete_entries_are_skipped() {
        assert!(parse_entry("not json").is_none());
        assert!(parse_entry(r#"{"MESSAGE":"no time"}"#).is_none());
        assert!(parse_entry(r#"{"__REALTIME_TIMESTAMP":"1","MESSAGE":null}"#).is_none());
    }

    #[test]
    fn reads_from_command_output() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = fake_journalctl(
            dir.path(),
            r#"[ "$1" = "--version" ] && exit 0
echo '{"__REALTIME_TIMESTAMP":"100000000","SYSLOG_IDENTIFIER":"a","MESSAGE":"one"}'
echo 'garbage'
echo '{"__REALTIME_TIMESTAMP":"200000000","SYSLOG_IDENTIFIER":"b","MESSAGE":"two"}'"#,
        );
        let mut src = JournaldSource::with_command(cmd);
        src.init().unwrap();

        let records = drain(&mut src, DateTime::<Utc>::UNIX_EPOCH);
        assert!(src.error().is_none(), "{:?}", src.error());
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].message, "two");

        let later = drain(&mut src, logship_core::time::from_unix(150));
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].source, "b");
    }

    #[test]
    fn failing_command_sets_error() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = fake_journalctl(dir.path(), "exit 3");
        let mut src = JournaldSource::with_command(cmd);
        assert!(matches!(src.init(), Err(SourceError::Exit { .. })));

        assert!(drain(&mut src, DateTime::<Utc>::UNIX_EPOCH).is_empty());
        assert!(matches!(src.error(), Some(SourceError::Exit { .. })));
    }

    struct Broken;

    impl std::io::Read for Broken {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("pipe broke"))
        }
    }

    #[test]
    fn stream_survives_bad_bytes_and_reports_read_errors() {
        use std::io::Read;

        let output: &[u8] = b"\xff\xfe not json\n\
{\"__REALTIME_TIMESTAMP\":\"100000000\",\"_COMM\":\"a\",\"MESSAGE\":\"one\"}\n";
        let (tx, mut rx) = mpsc::channel::<Record>(4);
        let (sent, gone) =
            stream_entries(BufReader::new(output), DateTime::<Utc>::UNIX_EPOCH, &tx).unwrap();
        assert_eq!((sent, gone), (1, false));
        assert_eq!(rx.try_recv().unwrap().message, "one");

        let broken = BufReader::new(output.chain(Broken));
        let err = stream_entries(broken, DateTime::<Utc>::UNIX_EPOCH, &tx).unwrap_err();
        assert_eq!(err.to_string(), "pipe broke");
    }

    #[test]
    fn missing_command_fails_init() {
        let mut src = JournaldSource::with_command("/nonexistent/journalctl");
        assert!(matches!(src.init(), Err(SourceError::Spawn { .. })));
    }
}
