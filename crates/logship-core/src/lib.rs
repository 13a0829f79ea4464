//! Shared types for the logship agent, server and store.

pub mod ids;
pub mod model;
pub mod response;
pub mod time;

pub use ids::SessionToken;
pub use model::{Host, Record, Search, SearchMatcher, SearchQuery};
pub use response::Response;
