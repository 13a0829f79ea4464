use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use logship_core::time::from_unix;
use logship_core::{Host, Record, Search, SearchMatcher, SearchQuery};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tokio::sync::mpsc::Sender;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::StoreError;
use crate::query::QueryId;
use crate::row_helpers::{self, row_to_host, row_to_record};
use crate::schema;

/// Pause before retrying a statement that failed with SQLITE_BUSY/LOCKED.
pub const RETRY_DELAY: Duration = Duration::from_millis(25);

/// A single SQLite handle with its own transaction and savepoint state.
///
/// Handles are `Send` but never shared between threads; the
/// [`Pool`](crate::Pool) is the only way to hand them around. Busy and
/// locked errors are retried every `retry_delay` until they clear.
pub struct Database {
    conn: Connection,
    path: PathBuf,
    retry_delay: Duration,
    in_tx: bool,
    savepoints: Savepoints,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("in_tx", &self.in_tx)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_retry(path, RETRY_DELAY)
    }

    pub fn open_with_retry(path: &Path, retry_delay: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }

        let conn = Connection::open(path)?;
        let db = Self::init(conn, path.to_owned(), retry_delay)?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, PathBuf::from(":memory:"), RETRY_DELAY)
    }

    fn init(conn: Connection, path: PathBuf, retry_delay: Duration) -> Result<Self, StoreError> {
        conn.set_prepared_statement_cache_capacity(QueryId::ALL.len());

        let db = Self {
            conn,
            path,
            retry_delay,
            in_tx: false,
            savepoints: Savepoints::default(),
        };

        db.with_conn(|conn| conn.execute_batch(schema::PRAGMAS))
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        db.with_conn(|conn| conn.execute_batch(schema::CREATE_TABLES))
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

        let version: Option<u32> = db.with_conn(|conn| {
            conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
                .optional()
        })?;
        if version.is_none() {
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    [schema::SCHEMA_VERSION],
                )
            })
            .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
        }

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection, retrying while SQLite reports the
    /// database as busy or locked.
    pub fn with_conn<F, T>(&self, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T>,
    {
        loop {
            match f(&self.conn) {
                Err(e) if is_transient(&e) => {
                    trace!(error = %e, delay_ms = self.retry_delay.as_millis() as u64, "database busy, retrying");
                    thread::sleep(self.retry_delay);
                }
                result => return result.map_err(StoreError::from),
            }
        }
    }

    fn query_rows<T>(
        &self,
        id: QueryId,
        params: &[&dyn ToSql],
        map: fn(&Row<'_>) -> Result<T, StoreError>,
    ) -> Result<Vec<T>, StoreError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(id.sql())?;
            let rows = stmt.query_map(params, |row| Ok(map(row)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        rows.into_iter().collect()
    }

    fn query_opt<T>(
        &self,
        id: QueryId,
        params: &[&dyn ToSql],
        map: fn(&Row<'_>) -> Result<T, StoreError>,
    ) -> Result<Option<T>, StoreError> {
        let row = self.with_conn(|conn| {
            conn.prepare_cached(id.sql())?
                .query_row(params, |row| Ok(map(row)))
                .optional()
        })?;
        row.transpose()
    }

    fn query_scalar<T: rusqlite::types::FromSql>(
        &self,
        id: QueryId,
        params: &[&dyn ToSql],
    ) -> Result<T, StoreError> {
        self.with_conn(|conn| conn.prepare_cached(id.sql())?.query_row(params, |row| row.get(0)))
    }

    fn execute(&self, id: QueryId, params: &[&dyn ToSql]) -> Result<usize, StoreError> {
        self.with_conn(|conn| conn.prepare_cached(id.sql())?.execute(params))
    }

    // ── Transactions ────────────────────────────────────────────────

    pub fn in_transaction(&self) -> bool {
        self.in_tx
    }

    /// Start an explicit transaction. Only one may be open per handle.
    pub fn begin(&mut self) -> Result<(), StoreError> {
        if self.in_tx {
            return Err(StoreError::TransactionInProgress);
        }
        self.with_conn(|conn| conn.execute_batch("BEGIN IMMEDIATE"))?;
        self.in_tx = true;
        self.savepoints.reset();
        trace!(path = %self.path.display(), "transaction started");
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), StoreError> {
        if !self.in_tx {
            return Err(StoreError::NoTransactionInProgress);
        }
        let result = self.with_conn(|conn| conn.execute_batch("COMMIT"));
        self.in_tx = !self.conn.is_autocommit();
        if !self.in_tx {
            self.savepoints.reset();
        }
        result
    }

    pub fn rollback(&mut self) -> Result<(), StoreError> {
        if !self.in_tx {
            return Err(StoreError::NoTransactionInProgress);
        }
        let result = self.with_conn(|conn| conn.execute_batch("ROLLBACK"));
        self.in_tx = !self.conn.is_autocommit();
        if !self.in_tx {
            self.savepoints.reset();
        }
        result
    }

    /// Run `f` inside a transaction.
    ///
    /// Joins the caller's transaction when one is open; otherwise opens one
    /// and commits on `Ok` or rolls back on `Err`.
    pub fn with_transaction<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Self) -> Result<T, StoreError>,
    {
        if self.in_tx {
            return f(self);
        }

        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = self.rollback() {
                    error!(error = %rb, "rollback after failed operation also failed");
                }
                Err(e)
            }
        }
    }

    // ── Savepoints ──────────────────────────────────────────────────

    /// Create a named savepoint inside the open transaction.
    pub fn savepoint_create(&mut self, name: &str) -> Result<(), StoreError> {
        if !self.in_tx {
            return Err(StoreError::NoTransactionInProgress);
        }
        let internal = self.savepoints.push(name);
        let sql = format!("SAVEPOINT {internal}");
        if let Err(e) = self.with_conn(|conn| conn.execute_batch(&sql)) {
            self.savepoints.live.pop();
            return Err(e);
        }
        debug!(name, internal = %internal, "savepoint created");
        Ok(())
    }

    /// Keep the changes made since `name` and forget `name` together with
    /// every savepoint created before it.
    pub fn savepoint_release(&mut self, name: &str) -> Result<(), StoreError> {
        if !self.in_tx {
            return Err(StoreError::NoTransactionInProgress);
        }
        let pos = self
            .savepoints
            .position(name)
            .ok_or_else(|| StoreError::InvalidSavepoint(name.to_string()))?;

        // SQLite's RELEASE also drops later savepoints, so only issue it
        // when nothing was created after this one.
        if pos + 1 == self.savepoints.live.len() {
            let sql = format!("RELEASE SAVEPOINT {}", self.savepoints.live[pos].1);
            self.with_conn(|conn| conn.execute_batch(&sql))?;
        }
        self.savepoints.live.drain(..=pos);
        debug!(name, "savepoint released");
        Ok(())
    }

    /// Discard everything done since `name`, removing it and every savepoint
    /// created after it.
    pub fn savepoint_rollback(&mut self, name: &str) -> Result<(), StoreError> {
        if !self.in_tx {
            return Err(StoreError::NoTransactionInProgress);
        }
        let pos = self
            .savepoints
            .position(name)
            .ok_or_else(|| StoreError::InvalidSavepoint(name.to_string()))?;

        let internal = self.savepoints.live[pos].1.clone();
        let sql = format!("ROLLBACK TO SAVEPOINT {internal}; RELEASE SAVEPOINT {internal};");
        self.with_conn(|conn| conn.execute_batch(&sql))?;
        self.savepoints.live.truncate(pos);
        debug!(name, "rolled back to savepoint");
        Ok(())
    }

    // ── Hosts ───────────────────────────────────────────────────────

    /// Insert a host and write the assigned id back into it.
    #[instrument(skip(self, host), fields(name = %host.name))]
    pub fn host_add(&mut self, host: &mut Host) -> Result<(), StoreError> {
        if host.name.trim().is_empty() {
            return Err(StoreError::InvalidValue("host name must not be empty".into()));
        }

        let stamp = host.last_seen.timestamp();
        let name = host.name.as_str();
        let id: i64 = self.with_transaction(|db| {
            db.query_scalar(QueryId::HostAdd, params![name, stamp])
        })?;

        host.id = id;
        debug!(id, "host added");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn host_get_by_name(&self, name: &str) -> Result<Option<Host>, StoreError> {
        self.query_opt(QueryId::HostGetByName, params![name], row_to_host)
    }

    #[instrument(skip(self))]
    pub fn host_get_by_id(&self, id: i64) -> Result<Option<Host>, StoreError> {
        self.query_opt(QueryId::HostGetById, params![id], row_to_host)
    }

    /// All hosts, ordered by name.
    pub fn host_get_all(&self) -> Result<Vec<Host>, StoreError> {
        self.query_rows(QueryId::HostGetAll, params![], row_to_host)
    }

    #[instrument(skip(self, host), fields(host_id = host.id))]
    pub fn host_update_last_seen(
        &mut self,
        host: &mut Host,
        stamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let id = host.id;
        let changed = self.with_transaction(|db| {
            db.execute(QueryId::HostUpdateLastSeen, params![stamp.timestamp(), id])
        })?;
        if changed == 0 {
            return Err(StoreError::InvalidValue(format!("no host with id {id}")));
        }
        host.last_seen = stamp;
        Ok(())
    }

    /// Delete a host and, by cascade, all of its records.
    #[instrument(skip(self))]
    pub fn host_delete(&mut self, id: i64) -> Result<bool, StoreError> {
        let changed = self.with_transaction(|db| db.execute(QueryId::HostDelete, params![id]))?;
        if changed > 0 {
            info!(host_id = id, "host deleted");
        }
        Ok(changed > 0)
    }

    // ── Records ─────────────────────────────────────────────────────

    /// Insert a record, filling in its checksum and id.
    ///
    /// Fails with [`StoreError::DuplicateKey`] when a record with the same
    /// checksum is already stored; the record is left untouched then.
    #[instrument(skip(self, record), fields(host_id = record.host_id, source = %record.source))]
    pub fn record_add(&mut self, record: &mut Record) -> Result<(), StoreError> {
        let checksum = record.compute_checksum();
        let (host_id, stamp) = (record.host_id, record.time.timestamp());
        let (source, message) = (record.source.as_str(), record.message.as_str());

        let id: i64 = self.with_transaction(|db| {
            db.query_scalar(
                QueryId::RecordAdd,
                params![host_id, stamp, source, message, checksum],
            )
        })?;

        record.id = id;
        record.checksum = Some(checksum);
        trace!(id, "record added");
        Ok(())
    }

    pub fn record_check_exist(&self, checksum: &str) -> Result<bool, StoreError> {
        let cnt: i64 = self.query_scalar(QueryId::RecordCheckExist, params![checksum])?;
        Ok(cnt > 0)
    }

    /// Timestamp of the newest record of a host; the Unix epoch when it has
    /// none.
    #[instrument(skip(self))]
    pub fn record_get_most_recent(&self, host_id: i64) -> Result<DateTime<Utc>, StoreError> {
        let secs: i64 = self.query_scalar(QueryId::RecordGetMostRecent, params![host_id])?;
        Ok(from_unix(secs))
    }

    /// Newest `max` records of a host, newest first. Negative `max` returns
    /// all of them.
    pub fn record_get_by_host(&self, host_id: i64, max: i64) -> Result<Vec<Record>, StoreError> {
        self.query_rows(QueryId::RecordGetByHost, params![host_id, max], row_to_record)
    }

    /// Records with `begin <= time <= end`, oldest first.
    pub fn record_get_by_period(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Record>, StoreError> {
        self.query_rows(
            QueryId::RecordGetByPeriod,
            params![begin.timestamp(), end.timestamp()],
            row_to_record,
        )
    }

    /// Newest `max` records across all hosts. Negative `max` returns all.
    pub fn record_get_recent(&self, max: i64) -> Result<Vec<Record>, StoreError> {
        self.query_rows(QueryId::RecordGetRecent, params![max], row_to_record)
    }

    /// Number of records per source.
    pub fn record_get_sources(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let pairs = self.query_rows(QueryId::RecordGetSources, params![], |row| {
            Ok((
                row_helpers::get::<String>(row, 0, "record", "source")?,
                row_helpers::get::<i64>(row, 1, "record", "source")?,
            ))
        })?;
        Ok(pairs.into_iter().collect())
    }

    /// Scan every record in `(stamp, id)` order and send the ones `matcher`
    /// accepts.
    ///
    /// Blocks on the channel, so call it from a blocking thread. The sender
    /// is dropped on return, which closes the channel. Returns the number of
    /// records sent; stops early if the receiver goes away.
    #[instrument(skip_all)]
    pub fn record_search(
        &self,
        matcher: &SearchMatcher,
        tx: Sender<Record>,
    ) -> Result<usize, StoreError> {
        let mut sent = 0usize;
        let mut last: Option<(i64, i64)> = None;
        let mut failure: Option<StoreError> = None;
        let mut receiver_gone = false;

        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(QueryId::RecordGetAll.sql())?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let key: (i64, i64) = (row.get(2)?, row.get(0)?);
                // A busy restart rescans from the top; skip what was seen.
                if last.is_some_and(|seen| key <= seen) {
                    continue;
                }
                last = Some(key);

                let record = match row_to_record(row) {
                    Ok(r) => r,
                    Err(e) => {
                        failure = Some(e);
                        return Ok(());
                    }
                };
                if !matcher.matches(&record) {
                    continue;
                }
                if tx.blocking_send(record).is_err() {
                    receiver_gone = true;
                    return Ok(());
                }
                sent += 1;
            }
            Ok(())
        })?;

        if let Some(e) = failure {
            return Err(e);
        }
        if receiver_gone {
            warn!(sent, "search receiver dropped before the scan finished");
        }
        debug!(sent, "record search finished");
        Ok(sent)
    }

    // ── Searches ────────────────────────────────────────────────────

    /// Persist a search; writes back its id and sets `count` to the number
    /// of results.
    #[instrument(skip(self, search), fields(count = search.results.len()))]
    pub fn search_add(&mut self, search: &mut Search) -> Result<(), StoreError> {
        let query = serde_json::to_string(&search.query)?;
        let results = serde_json::to_string(&search.results)?;
        let cnt = search.results.len() as i64;
        let stamp = search.timestamp.timestamp();

        let id: i64 = self.with_transaction(|db| {
            db.query_scalar(QueryId::SearchAdd, params![stamp, query, results, cnt])
        })?;

        search.id = id;
        search.count = cnt;
        debug!(id, "search saved");
        Ok(())
    }

    pub fn search_get_by_id(&self, id: i64) -> Result<Option<Search>, StoreError> {
        self.query_opt(QueryId::SearchGetById, params![id], row_to_search)
    }

    #[instrument(skip(self))]
    pub fn search_delete(&mut self, id: i64) -> Result<bool, StoreError> {
        let changed = self.with_transaction(|db| db.execute(QueryId::SearchDelete, params![id]))?;
        Ok(changed > 0)
    }

    /// A window of a search's result records, in result order.
    pub fn search_get_results(
        &self,
        id: i64,
        offset: i64,
        cnt: i64,
    ) -> Result<Vec<Record>, StoreError> {
        self.query_rows(QueryId::SearchGetResults, params![id, offset, cnt], row_to_record)
    }

    /// `(id, count)` of every stored search.
    pub fn search_get_all_id(&self) -> Result<Vec<(i64, i64)>, StoreError> {
        self.query_rows(QueryId::SearchGetAllId, params![], |row| {
            Ok((
                row_helpers::get(row, 0, "search", "id")?,
                row_helpers::get(row, 1, "search", "cnt")?,
            ))
        })
    }

    pub fn search_get_result_count(&self, id: i64) -> Result<Option<i64>, StoreError> {
        self.query_opt(QueryId::SearchGetResultCount, params![id], |row| {
            row_helpers::get(row, 0, "search", "cnt")
        })
    }

    // ── Housekeeping ────────────────────────────────────────────────

    /// Checkpoint the WAL, vacuum, reindex and analyze.
    ///
    /// Refuses to run inside a transaction. Individual step failures are
    /// logged and do not stop the remaining steps.
    #[instrument(skip(self))]
    pub fn perform_maintenance(&mut self) -> Result<(), StoreError> {
        if self.in_tx {
            return Err(StoreError::TransactionInProgress);
        }
        for step in schema::MAINTENANCE {
            if let Err(e) = self.with_conn(|conn| conn.execute_batch(step)) {
                error!(step, error = %e, "maintenance step failed");
            }
        }
        info!("maintenance finished");
        Ok(())
    }

    /// Roll back a pending transaction, flush the statement cache and close
    /// the connection.
    pub fn close(mut self) -> Result<(), StoreError> {
        if self.in_tx {
            warn!(path = %self.path.display(), "closing with an open transaction, rolling back");
            self.rollback()?;
        }
        self.conn.flush_prepared_statement_cache();
        let path = self.path;
        self.conn.close().map_err(|(_, e)| StoreError::from(e))?;
        debug!(path = %path.display(), "database closed");
        Ok(())
    }
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Columns: id, timestamp, query, results, cnt.
fn row_to_search(row: &Row<'_>) -> Result<Search, StoreError> {
    let query: String = row_helpers::get(row, 2, "search", "query")?;
    let results: String = row_helpers::get(row, 3, "search", "results")?;
    Ok(Search {
        id: row_helpers::get(row, 0, "search", "id")?,
        timestamp: row_helpers::get_time(row, 1, "search", "timestamp")?,
        query: row_helpers::parse_json::<SearchQuery>(&query, "search", "query")?,
        results: row_helpers::parse_json(&results, "search", "results")?,
        count: row_helpers::get(row, 4, "search", "cnt")?,
    })
}

/// User savepoint names mapped to generated SQL identifiers.
///
/// Names are never spliced into SQL; the counter restarts with every
/// transaction.
#[derive(Debug, Default)]
struct Savepoints {
    counter: u32,
    /// `(user name, internal name)` in creation order.
    live: Vec<(String, String)>,
}

impl Savepoints {
    fn reset(&mut self) {
        self.counter = 0;
        self.live.clear();
    }

    fn push(&mut self, name: &str) -> String {
        self.counter += 1;
        let internal = format!("Savepoint{:05}", self.counter);
        self.live.push((name.to_string(), internal.clone()));
        internal
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.live.iter().rposition(|(n, _)| n == name)
    }
}
