//! Schema and `user_version` migrations for the SQLite engine.
//!
//! All topics share one database. Event rows keep the encoded event
//! (`body`) next to its `time_key`, the 40-byte big-endian
//! `(timestamp, cid)` key whose BLOB ordering matches the in-memory index.
//! Links are kept relationally so missing-link detection is a single
//! anti-join.

use rusqlite::{Connection, types::Type};

use crate::store::StoreError;

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 2;

pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL
);

INSERT OR IGNORE INTO store_meta (id, schema_version) VALUES (1, 0);

CREATE TABLE IF NOT EXISTS events (
    topic TEXT NOT NULL,
    cid BLOB NOT NULL CHECK (length(cid) = 32),
    time_key BLOB NOT NULL CHECK (length(time_key) = 40),
    body BLOB NOT NULL,
    PRIMARY KEY (topic, cid)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS links (
    topic TEXT NOT NULL,
    cid BLOB NOT NULL,
    position INTEGER NOT NULL,
    link BLOB NOT NULL CHECK (length(link) = 32),
    PRIMARY KEY (topic, cid, position),
    FOREIGN KEY (topic, cid) REFERENCES events(topic, cid) ON DELETE CASCADE
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS heads (
    topic TEXT NOT NULL,
    cid BLOB NOT NULL,
    PRIMARY KEY (topic, cid),
    FOREIGN KEY (topic, cid) REFERENCES events(topic, cid) ON DELETE CASCADE
) WITHOUT ROWID;
";

pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_topic_time ON events(topic, time_key);
CREATE INDEX IF NOT EXISTS idx_links_topic_link ON links(topic, link);
";

/// Indexes that must exist after migration.
pub const REQUIRED_INDEXES: &[&str] = &["idx_events_topic_time", "idx_links_topic_link"];

const MIGRATIONS: &[(u32, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

/// Read `PRAGMA user_version` as a `u32`.
///
/// # Errors
///
/// Returns an error if the pragma cannot be read or is negative.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply pending migrations in ascending order, each in its own
/// transaction.
///
/// # Errors
///
/// Returns [`StoreError::SchemaTooNew`] when the file was written by a newer
/// schema, or the underlying SQLite error if a migration fails.
pub fn migrate(conn: &mut Connection) -> Result<u32, StoreError> {
    let mut current = current_schema_version(conn)?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: current,
            supported: LATEST_SCHEMA_VERSION,
        });
    }

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.execute(
            "UPDATE store_meta SET schema_version = ?1 WHERE id = 1",
            [i64::from(*version)],
        )?;
        tx.commit()?;
        current = *version;
    }

    Ok(current)
}
