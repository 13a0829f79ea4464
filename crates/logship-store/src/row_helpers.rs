use chrono::{DateTime, Utc};
use logship_core::{Host, Record};

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Read an epoch-seconds column as a timestamp.
pub fn get_time(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    let secs: i64 = get(row, idx, table, column)?;
    DateTime::from_timestamp(secs, 0).ok_or_else(|| StoreError::CorruptRow {
        table,
        column,
        detail: format!("timestamp out of range: {secs}"),
    })
}

/// Parse a JSON string column, returning CorruptRow on parse failure.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Columns: id, name, last_seen.
pub fn row_to_host(row: &rusqlite::Row<'_>) -> Result<Host, StoreError> {
    Ok(Host {
        id: get(row, 0, "host", "id")?,
        name: get(row, 1, "host", "name")?,
        last_seen: get_time(row, 2, "host", "last_seen")?,
    })
}

/// Columns: id, host_id, stamp, source, message, checksum.
pub fn row_to_record(row: &rusqlite::Row<'_>) -> Result<Record, StoreError> {
    Ok(Record {
        id: get(row, 0, "record", "id")?,
        host_id: get(row, 1, "record", "host_id")?,
        time: get_time(row, 2, "record", "stamp")?,
        source: get(row, 3, "record", "source")?,
        message: get(row, 4, "record", "message")?,
        checksum: Some(get(row, 5, "record", "checksum")?),
    })
}
