//! SQLite record store for hosts, log records and saved searches.

pub mod database;
pub mod error;
pub mod pool;
pub mod query;
pub mod row_helpers;
pub mod schema;

pub use database::{Database, RETRY_DELAY};
pub use error::StoreError;
pub use pool::{Pool, PooledDatabase};
