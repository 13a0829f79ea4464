use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDateTime, TimeZone, Utc};
use logship_core::Record;
use logship_settings::SourceKind;
use regex::Regex;
use tokio::sync::mpsc::Sender;
use tracing::{debug, trace, warn};

use super::{LogSource, SourceError};

/// `Mmm dd HH:MM:SS host tag[pid]: message`
const LINE_PATTERN: &str = r"^(?P<month>[A-Z][a-z]{2})\s+(?P<day>\d{1,2})\s+(?P<time>\d{2}:\d{2}:\d{2})\s+(?P<host>\S+)\s+(?P<tag>[^\s:\[]+)(?:\[(?P<pid>\d+)\])?:\s?(?P<msg>.*)$";

/// Reads BSD-style syslog files.
///
/// Every read rescans the files from the start; lines older than the
/// watermark are filtered out. Timestamps carry no year, so the current one
/// is assumed unless that would put the line in the future.
pub struct SyslogFileSource {
    paths: Vec<PathBuf>,
    pattern: Regex,
    last_error: Option<SourceError>,
}

impl SyslogFileSource {
    pub fn new(paths: Vec<PathBuf>) -> Result<Self, SourceError> {
        if paths.is_empty() {
            return Err(SourceError::NoPaths);
        }
        Ok(Self {
            paths,
            pattern: Regex::new(LINE_PATTERN)?,
            last_error: None,
        })
    }

    /// Parse one line, inferring the year relative to `now`.
    pub fn parse_line(&self, line: &str, now: DateTime<Local>) -> Option<Record> {
        let caps = self.pattern.captures(line)?;
        let stamp = format!("{} {} {}", &caps["month"], &caps["day"], &caps["time"]);

        let local = |year: i32| {
            NaiveDateTime::parse_from_str(&format!("{year} {stamp}"), "%Y %b %d %H:%M:%S")
                .ok()
                .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        };
        let mut time = local(now.year())?;
        // A December line read in January belongs to last year.
        if time > now + Duration::days(1) {
            time = local(now.year() - 1)?;
        }

        Some(Record::new(
            time.with_timezone(&Utc),
            &caps["tag"],
            &caps["msg"],
        ))
    }

    /// Stream one file; returns false once the receiver is gone.
    fn read_file(&mut self, path: &PathBuf, begin: DateTime<Utc>, tx: &Sender<Record>) -> bool {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(source) => {
                warn!(path = %path.display(), error = %source, "cannot open log file");
                self.last_error = Some(SourceError::Open { path: path.clone(), source });
                return true;
            }
        };

        let now = Local::now();
        let (mut sent, mut skipped) = (0usize, 0usize);
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "read failed");
                    self.last_error = Some(SourceError::Read { path: path.clone(), source });
                    break;
                }
            }
            // Stray bytes in one line must not hide the rest of the file.
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            let Some(record) = self.parse_line(line, now) else {
                trace!(line = %line, "unparsable syslog line");
                skipped += 1;
                continue;
            };
            if record.time < begin {
                continue;
            }
            if tx.blocking_send(record).is_err() {
                debug!(path = %path.display(), sent, "receiver closed, stopping read");
                return false;
            }
            sent += 1;
        }
        debug!(path = %path.display(), sent, skipped, "log file read");
        true
    }
}

impl LogSource for SyslogFileSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Syslog
    }

    fn init(&mut self) -> Result<(), SourceError> {
        for path in &self.paths {
            File::open(path).map_err(|source| SourceError::Open {
                path: path.clone(),
                source,
            })?;
        }
        debug!(files = self.paths.len(), "syslog source ready");
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn read_from(&mut self, begin: DateTime<Utc>, tx: Sender<Record>) {
        self.last_error = None;
        for path in self.paths.clone() {
            if !self.read_file(&path, begin, &tx) {
                break;
            }
        }
    }

    fn error(&self) -> Option<&SourceError> {
        self.last_error.as_ref()
    }
}
