/// SQL DDL for the logship store.
/// Timestamps are integer epoch seconds. WAL mode + foreign keys are
/// enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS host (
    id          INTEGER PRIMARY KEY,
    name        TEXT UNIQUE NOT NULL,
    last_seen   INTEGER NOT NULL DEFAULT 0,
    CHECK (name <> '')
) STRICT;

CREATE TABLE IF NOT EXISTS record (
    id          INTEGER PRIMARY KEY,
    host_id     INTEGER NOT NULL,
    stamp       INTEGER NOT NULL DEFAULT 0,
    source      TEXT NOT NULL,
    message     TEXT NOT NULL,
    checksum    TEXT UNIQUE NOT NULL,
    FOREIGN KEY (host_id) REFERENCES host (id)
        ON UPDATE RESTRICT
        ON DELETE CASCADE
) STRICT;

CREATE INDEX IF NOT EXISTS record_host_idx ON record (host_id);
CREATE INDEX IF NOT EXISTS record_stamp_idx ON record (stamp);
CREATE INDEX IF NOT EXISTS record_source_idx ON record (source);

CREATE TABLE IF NOT EXISTS search (
    id          INTEGER PRIMARY KEY,
    timestamp   INTEGER NOT NULL,
    query       TEXT NOT NULL,
    results     TEXT NOT NULL,
    cnt         INTEGER NOT NULL DEFAULT 0,
    CHECK (json_valid(query)),
    CHECK (json_valid(results))
) STRICT;

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

/// Run by `Database::perform_maintenance`, in order.
pub const MAINTENANCE: [&str; 4] = [
    "PRAGMA wal_checkpoint(TRUNCATE)",
    "VACUUM",
    "REINDEX",
    "ANALYZE",
];
