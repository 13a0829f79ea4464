use thiserror::Error;

use crate::source::SourceError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered but refused the request.
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("server requires a registered session")]
    AuthRequired,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("log source error: {0}")]
    Source(#[from] SourceError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("giving up after {errors} consecutive failures: {last}")]
    Fatal { errors: u32, last: String },
}

impl AgentError {
    /// Errors that clear the registration so the next cycle registers again.
    pub fn needs_registration(&self) -> bool {
        matches!(self, Self::AuthRequired)
    }
}
