#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Any SQLite failure other than busy/locked, which are retried.
    #[error("database error: {0}")]
    Database(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("a transaction is already in progress")]
    TransactionInProgress,

    #[error("no transaction is in progress")]
    NoTransactionInProgress,

    #[error("that savepoint does not exist: {0}")]
    InvalidSavepoint(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, msg)
                if f.code == rusqlite::ErrorCode::ConstraintViolation
                    && f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                StoreError::DuplicateKey(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_maps_to_duplicate_key() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v TEXT UNIQUE); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err: StoreError = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert!(err.is_duplicate(), "got {err:?}");
    }

    #[test]
    fn other_failures_map_to_database() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: StoreError = conn.execute("SELECT * FROM missing", []).unwrap_err().into();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
