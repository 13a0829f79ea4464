use std::collections::HashSet;

use chrono::{DateTime, Utc};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::time::{self, format_subsecond};

/// A machine that ships logs to the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Assigned by the store; zero until the host has been added.
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub last_seen: DateTime<Utc>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            last_seen: Utc::now(),
        }
    }
}

/// A single log line.
///
/// Agents create records without `id` or `checksum`; the server fills both
/// in on ingest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub host_id: i64,
    pub time: DateTime<Utc>,
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Record {
    pub fn new(time: DateTime<Utc>, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            host_id: 0,
            time,
            source: source.into(),
            message: message.into(),
            checksum: None,
        }
    }

    /// SHA-512 over host, sub-second timestamp, source and message.
    ///
    /// Two records with the same checksum are the same event.
    pub fn compute_checksum(&self) -> String {
        let raw = format!(
            "{}##{}##{}##{}",
            self.host_id,
            format_subsecond(&self.time),
            self.source,
            self.message
        );
        format!("{:x}", Sha512::digest(raw.as_bytes()))
    }
}

/// Filter parameters for searching the record table.
///
/// Empty filters match everything; non-empty ones are combined with AND.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub hosts: Vec<i64>,
    #[serde(default)]
    pub sources: Vec<String>,
    /// Inclusive `[begin, end]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Regular expressions searched (unanchored) in the message.
    #[serde(default)]
    pub terms: Vec<String>,
}

impl SearchQuery {
    /// Compile the term patterns into a reusable matcher.
    pub fn compile(&self) -> Result<SearchMatcher, regex::Error> {
        let terms = if self.terms.is_empty() {
            None
        } else {
            Some(RegexSet::new(&self.terms)?)
        };

        Ok(SearchMatcher {
            hosts: self.hosts.iter().copied().collect(),
            sources: self.sources.iter().cloned().collect(),
            period: self.period,
            terms,
        })
    }
}

/// Compiled form of a [`SearchQuery`].
#[derive(Clone, Debug)]
pub struct SearchMatcher {
    hosts: HashSet<i64>,
    sources: HashSet<String>,
    period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    terms: Option<RegexSet>,
}

impl SearchMatcher {
    pub fn matches(&self, record: &Record) -> bool {
        if let Some((begin, end)) = &self.period {
            if record.time < *begin || record.time > *end {
                return false;
            }
        }
        if !self.sources.is_empty() && !self.sources.contains(&record.source) {
            return false;
        }
        if !self.hosts.is_empty() && !self.hosts.contains(&record.host_id) {
            return false;
        }
        match &self.terms {
            Some(set) => set.is_match(&record.message),
            None => true,
        }
    }
}

/// A persisted search and the ids of the records it matched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Search {
    #[serde(default)]
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub query: SearchQuery,
    pub results: Vec<i64>,
    pub count: i64,
}

impl Search {
    pub fn new(query: SearchQuery, results: Vec<i64>) -> Self {
        let count = results.len() as i64;
        Self {
            id: 0,
            timestamp: Utc::now(),
            query,
            results,
            count,
        }
    }
}

impl Default for Search {
    fn default() -> Self {
        Self {
            id: 0,
            timestamp: time::epoch(),
            query: SearchQuery::default(),
            results: Vec::new(),
            count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::from_unix;
    use chrono::Duration;

    fn record(host_id: i64, secs: i64, source: &str, message: &str) -> Record {
        Record {
            host_id,
            ..Record::new(from_unix(secs), source, message)
        }
    }

    #[test]
    fn checksum_is_stable_and_hex() {
        let r = record(1, 100, "sshd", "Accepted publickey");
        let a = r.compute_checksum();
        assert_eq!(a, r.compute_checksum());
        assert_eq!(a.len(), 128);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn checksum_ignores_id() {
        let a = record(1, 100, "sshd", "x");
        let b = Record { id: 42, ..a.clone() };
        assert_eq!(a.compute_checksum(), b.compute_checksum());
    }

    #[test]
    fn checksum_distinguishes_fields() {
        let base = record(1, 100, "sshd", "x");
        let variants = [
            Record { host_id: 2, ..base.clone() },
            Record { time: base.time + Duration::milliseconds(1), ..base.clone() },
            Record { source: "cron".into(), ..base.clone() },
            Record { message: "y".into(), ..base.clone() },
        ];
        for v in &variants {
            assert_ne!(v.compute_checksum(), base.compute_checksum(), "{v:?}");
        }
    }

    #[test]
    fn empty_query_matches_everything() {
        let m = SearchQuery::default().compile().unwrap();
        assert!(m.matches(&record(9, 0, "", "")));
    }

    #[test]
    fn filters_are_conjunctive() {
        let q = SearchQuery {
            hosts: vec![2],
            sources: vec!["sshd".into()],
            period: Some((from_unix(100), from_unix(200))),
            terms: vec!["fail(ed|ure)".into(), "denied".into()],
        };
        let m = q.compile().unwrap();

        assert!(m.matches(&record(2, 150, "sshd", "authentication failure")));
        assert!(m.matches(&record(2, 100, "sshd", "permission denied")));
        assert!(m.matches(&record(2, 200, "sshd", "login failed")));

        assert!(!m.matches(&record(3, 150, "sshd", "login failed")), "wrong host");
        assert!(!m.matches(&record(2, 150, "cron", "login failed")), "wrong source");
        assert!(!m.matches(&record(2, 99, "sshd", "login failed")), "before period");
        assert!(!m.matches(&record(2, 201, "sshd", "login failed")), "after period");
        assert!(!m.matches(&record(2, 150, "sshd", "login ok")), "no term");
    }

    #[test]
    fn invalid_term_fails_to_compile() {
        let q = SearchQuery {
            terms: vec!["(unclosed".into()],
            ..Default::default()
        };
        assert!(q.compile().is_err());
    }

    #[test]
    fn query_json_shape() {
        let q = SearchQuery {
            hosts: vec![1, 2, 3],
            sources: vec!["slime".into()],
            period: Some((from_unix(60), from_unix(120))),
            terms: Vec::new(),
        };
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["hosts"], serde_json::json!([1, 2, 3]));
        assert_eq!(json["period"].as_array().map(Vec::len), Some(2));

        let back: SearchQuery = serde_json::from_value(json).unwrap();
        assert_eq!(back, q);
    }

    #[test]
    fn query_accepts_missing_fields() {
        let q: SearchQuery = serde_json::from_str(r#"{"hosts":[2]}"#).unwrap();
        assert_eq!(q.hosts, vec![2]);
        assert!(q.sources.is_empty());
        assert!(q.period.is_none());
    }

    #[test]
    fn search_count_tracks_results() {
        let s = Search::new(SearchQuery::default(), vec![4, 5, 6]);
        assert_eq!(s.count, 3);
        assert_eq!(s.id, 0);
    }

    #[test]
    fn agent_record_omits_checksum_on_the_wire() {
        let r = Record::new(from_unix(1), "kernel", "boot");
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("checksum").is_none());
        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }
}
