//! Log shipping agent: reads a local log source and submits new records to
//! the server.

pub mod agent;
pub mod client;
pub mod cookies;
pub mod error;
pub mod source;

pub use agent::{Agent, AgentConfig, AgentHandle, SyncState};
pub use client::ServerClient;
pub use error::AgentError;
pub use source::{open_source, JournaldSource, LogSource, SourceError, SyslogFileSource};
