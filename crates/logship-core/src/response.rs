use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reply envelope shared by the agent protocol and the ajax endpoints.
///
/// `status == false` with HTTP 200 is a request-level rejection; the
/// `message` says why.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub timestamp: DateTime<Utc>,
    pub status: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<BTreeMap<String, String>>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            status: true,
            message: message.into(),
            payload: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: false,
            ..Self::ok(message)
        }
    }

    /// Attach one payload entry, creating the map on first use.
    pub fn with_payload(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.payload
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.to_string());
        self
    }

    pub fn payload_value(&self, key: &str) -> Option<&str> {
        self.payload.as_ref()?.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_omitted_when_empty() {
        let json = serde_json::to_value(Response::ok("fine")).unwrap();
        assert_eq!(json["status"], true);
        assert_eq!(json["message"], "fine");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn payload_entries_accumulate() {
        let r = Response::ok("welcome").with_payload("ID", 7).with_payload("page", "2");
        assert_eq!(r.payload_value("ID"), Some("7"));
        assert_eq!(r.payload_value("page"), Some("2"));
        assert_eq!(r.payload_value("missing"), None);
    }

    #[test]
    fn failure_parses_back() {
        let raw = serde_json::to_string(&Response::failure("nope")).unwrap();
        let back: Response = serde_json::from_str(&raw).unwrap();
        assert!(!back.status);
        assert_eq!(back.message, "nope");
        assert!(back.payload.is_none());
    }
}
