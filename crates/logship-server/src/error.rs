use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::Json;
use logship_core::Response;
use logship_store::StoreError;
use thiserror::Error;
use tracing::{error, warn};

/// Header value sent with every envelope; replies are never cacheable.
pub const NO_STORE: &str = "no-store, max-age=0";

/// A successful reply: the envelope with HTTP 200.
#[derive(Debug)]
pub struct Reply(pub Response);

impl IntoResponse for Reply {
    fn into_response(self) -> HttpResponse {
        envelope(StatusCode::OK, self.0)
    }
}

impl From<Response> for Reply {
    fn from(resp: Response) -> Self {
        Self(resp)
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no valid session")]
    AuthRequired,

    /// Request understood but refused; reported with HTTP 200.
    #[error("{0}")]
    Rejected(String),

    #[error("malformed request body: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Path segment or query string that does not parse.
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthRequired => StatusCode::FORBIDDEN,
            Self::Rejected(_) => StatusCode::OK,
            Self::Serialization(_) | Self::BadRequest(_) | Self::Store(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {e}"))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        let status = self.status_code();
        match &self {
            Self::AuthRequired | Self::Rejected(_) => warn!(error = %self, "request refused"),
            _ => error!(error = %self, "request failed"),
        }
        envelope(status, Response::failure(self.to_string()))
    }
}

fn envelope(status: StatusCode, body: Response) -> HttpResponse {
    (status, [(header::CACHE_CONTROL, NO_STORE)], Json(body)).into_response()
}
