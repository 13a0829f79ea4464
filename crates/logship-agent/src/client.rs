//! HTTP client for the server's agent protocol.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use logship_core::time::parse_subsecond;
use logship_core::{Record, Response};
use reqwest::cookie::Jar;
use reqwest::{StatusCode, Url};
use tracing::{debug, instrument};

use crate::error::AgentError;

pub struct ServerClient {
    http: reqwest::Client,
    base: Url,
    jar: Arc<Jar>,
}

impl ServerClient {
    /// `base` must be an `http` or `https` URL.
    pub fn new(base: Url) -> Result<Self, AgentError> {
        if !matches!(base.scheme(), "http" | "https") {
            return Err(AgentError::Config(format!("unsupported server URL {base}")));
        }
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .build()?;
        Ok(Self { http, base, jar })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn jar(&self) -> &Jar {
        &self.jar
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, AgentError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| AgentError::Config(format!("server URL {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Register `hostname`, returning the host id the server assigned.
    #[instrument(skip(self))]
    pub async fn register(&self, hostname: &str, host_id: Option<i64>) -> Result<i64, AgentError> {
        let mut url = self.endpoint(&["ws", "init", hostname])?;
        if let Some(id) = host_id {
            url.query_pairs_mut().append_pair("id", &id.to_string());
        }

        let reply = envelope(self.http.get(url).send().await?).await?;
        let id = reply
            .payload_value("ID")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| malformed(&reply, "ID"))?;
        debug!(id, "registered");
        Ok(id)
    }

    /// Timestamp of the newest record the server holds for this host.
    pub async fn most_recent(&self) -> Result<DateTime<Utc>, AgentError> {
        let url = self.endpoint(&["ws", "most_recent"])?;
        let reply = envelope(self.http.get(url).send().await?).await?;
        reply
            .payload_value("timestamp")
            .and_then(|v| parse_subsecond(v).ok())
            .ok_or_else(|| malformed(&reply, "timestamp"))
    }

    /// Submit a batch; returns how many records were new to the server.
    #[instrument(skip_all, fields(count = records.len()))]
    pub async fn submit(&self, records: &[Record]) -> Result<usize, AgentError> {
        let url = self.endpoint(&["ws", "submit_records"])?;
        let body = serde_json::to_vec(records)?;
        let resp = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let reply = envelope(resp).await?;
        Ok(reply
            .payload_value("added")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}

/// Decode the reply envelope, mapping refusals to errors.
async fn envelope(resp: reqwest::Response) -> Result<Response, AgentError> {
    let status = resp.status();
    if status == StatusCode::FORBIDDEN {
        return Err(AgentError::AuthRequired);
    }
    let bytes = resp.bytes().await?;
    let reply: Response = match serde_json::from_slice(&bytes) {
        Ok(r) => r,
        Err(e) if status.is_success() => return Err(e.into()),
        Err(_) => {
            return Err(AgentError::Rejected {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            })
        }
    };
    if !status.is_success() || !reply.status {
        return Err(AgentError::Rejected {
            status: status.as_u16(),
            message: reply.message,
        });
    }
    Ok(reply)
}

fn malformed(reply: &Response, key: &str) -> AgentError {
    AgentError::Rejected {
        status: StatusCode::OK.as_u16(),
        message: format!("reply {:?} lacks a valid {key}", reply.message),
    }
}
