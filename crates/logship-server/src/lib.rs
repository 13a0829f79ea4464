//! HTTP server: agent registration and ingest, saved searches.

pub mod error;
pub mod handlers;
pub mod search;
pub mod server;
pub mod session;

pub use error::{ApiError, Reply};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use session::{SessionStore, SESSION_COOKIE};
