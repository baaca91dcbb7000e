//! SQLite storage engine.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so readers do not block the writer
//! - `busy_timeout = 5s` to absorb transient lock contention
//! - `foreign_keys = ON` so link and head rows always name a stored event
//!
//! One connection is shared by every topic of a node behind a
//! `parking_lot::Mutex`; each store call runs on the blocking thread pool.

pub mod query;
pub mod schema;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use super::{NodeStore, Store, StoreError};
use crate::event::{Cid, Envelope, Event};
use crate::query::{QueryError, QueryPage, QueryRequest};

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Node store
// ---------------------------------------------------------------------------

/// All topics of a node in one SQLite database.
#[derive(Clone)]
pub struct SqliteNodeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteNodeStore {
    /// Open (or create) the database at `path`, apply pragmas and migrate
    /// the schema to the latest version.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the directory cannot be created or the
    /// database cannot be opened, configured or migrated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "opened sqlite store");
        Self::from_connection(conn)
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if configuration or migration fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        configure_connection(&conn)?;
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Concrete handle for `topic`.
    #[must_use]
    pub fn sqlite_topic(&self, topic: &str) -> SqliteStore {
        SqliteStore {
            topic: Arc::from(topic),
            conn: Arc::clone(&self.conn),
        }
    }
}

#[async_trait]
impl NodeStore for SqliteNodeStore {
    fn topic(&self, topic: &str) -> Result<Arc<dyn Store>, StoreError> {
        Ok(Arc::new(self.sqlite_topic(topic)))
    }

    async fn topics(&self) -> Result<Vec<String>, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn.prepare("SELECT DISTINCT topic FROM events ORDER BY topic")?;
            let topics = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok::<_, StoreError>(topics)
        })
        .await
        .map_err(|err| StoreError::Worker(err.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Topic store
// ---------------------------------------------------------------------------

/// One topic's view of a [`SqliteNodeStore`].
#[derive(Clone)]
pub struct SqliteStore {
    topic: Arc<str>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Run `op` against the shared connection on the blocking pool.
    async fn run_with<T, E, F>(&self, op: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T, E> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let topic = Arc::clone(&self.topic);
        tokio::task::spawn_blocking(move || op(&mut conn.lock(), &topic))
            .await
            .map_err(|err| E::from(StoreError::Worker(err.to_string())))?
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T, StoreError> + Send + 'static,
    {
        self.run_with(op).await
    }
}

fn cid_from_row(bytes: &[u8]) -> Result<Cid, StoreError> {
    Ok(Cid::from_slice(bytes)?)
}

fn decode(body: &[u8]) -> Result<Arc<Event>, StoreError> {
    Ok(Arc::new(Event::from_bytes(body)?))
}

/// Insert the event row and its links. Returns `false` if already stored.
fn insert_row(conn: &Connection, topic: &str, event: &Event) -> Result<bool, StoreError> {
    let cid = event.cid();
    let inserted = conn
        .prepare_cached(
            "INSERT OR IGNORE INTO events (topic, cid, time_key, body) VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![
            topic,
            cid.as_bytes().as_slice(),
            event.time_key().to_bytes().as_slice(),
            event.to_bytes(),
        ])?;
    if inserted == 0 {
        return Ok(false);
    }

    let mut stmt = conn.prepare_cached(
        "INSERT INTO links (topic, cid, position, link) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (position, link) in (0_i64..).zip(event.links()) {
        stmt.execute(params![
            topic,
            cid.as_bytes().as_slice(),
            position,
            link.as_bytes().as_slice()
        ])?;
    }
    Ok(true)
}

fn is_referenced(conn: &Connection, topic: &str, cid: Cid) -> Result<bool, StoreError> {
    Ok(conn
        .prepare_cached("SELECT EXISTS(SELECT 1 FROM links WHERE topic = ?1 AND link = ?2)")?
        .query_row(params![topic, cid.as_bytes().as_slice()], |row| row.get(0))?)
}

fn head_ids(conn: &Connection, topic: &str) -> Result<Vec<Cid>, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT cid FROM heads WHERE topic = ?1 ORDER BY cid")?;
    let rows = stmt
        .query_map([topic], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.iter().map(|bytes| cid_from_row(bytes)).collect()
}

#[async_trait]
impl Store for SqliteStore {
    async fn append_event(&self, envelope: Envelope) -> Result<Arc<Event>, StoreError> {
        self.run(move |conn, topic| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let links = head_ids(&tx, topic)?;
            let event = Event::new(envelope, links)?;
            insert_row(&tx, topic, &event)?;
            tx.execute("DELETE FROM heads WHERE topic = ?1", [topic])?;
            tx.execute(
                "INSERT INTO heads (topic, cid) VALUES (?1, ?2)",
                params![topic, event.cid().as_bytes().as_slice()],
            )?;
            tx.commit()?;
            Ok(Arc::new(event))
        })
        .await
    }

    async fn insert_event(&self, event: Arc<Event>) -> Result<bool, StoreError> {
        self.run(move |conn, topic| {
            let tx = conn.transaction()?;
            let added = insert_row(&tx, topic, &event)?;
            tx.commit()?;
            Ok(added)
        })
        .await
    }

    async fn insert_head(&self, event: Arc<Event>) -> Result<bool, StoreError> {
        self.run(move |conn, topic| {
            let tx = conn.transaction()?;
            let added = insert_row(&tx, topic, &event)?;
            if added && !is_referenced(&tx, topic, event.cid())? {
                tx.execute(
                    "INSERT OR IGNORE INTO heads (topic, cid) VALUES (?1, ?2)",
                    params![topic, event.cid().as_bytes().as_slice()],
                )?;
            }
            tx.commit()?;
            Ok(added)
        })
        .await
    }

    async fn remove_head(&self, cid: Cid) -> Result<bool, StoreError> {
        self.run(move |conn, topic| {
            let key = cid.as_bytes().as_slice();
            let known: bool = conn
                .prepare_cached("SELECT EXISTS(SELECT 1 FROM events WHERE topic = ?1 AND cid = ?2)")?
                .query_row(params![topic, key], |row| row.get(0))?;
            if known {
                conn.prepare_cached("DELETE FROM heads WHERE topic = ?1 AND cid = ?2")?
                    .execute(params![topic, key])?;
            }
            Ok(known)
        })
        .await
    }

    async fn find_missing_links(&self) -> Result<Vec<Cid>, StoreError> {
        self.run(|conn, topic| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT l.link FROM links l
                 WHERE l.topic = ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM events e WHERE e.topic = l.topic AND e.cid = l.link
                   )
                 ORDER BY l.link",
            )?;
            let rows = stmt
                .query_map([topic], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter().map(|bytes| cid_from_row(bytes)).collect()
        })
        .await
    }

    async fn events(&self) -> Result<Vec<Arc<Event>>, StoreError> {
        self.run(|conn, topic| {
            let mut stmt =
                conn.prepare_cached("SELECT body FROM events WHERE topic = ?1 ORDER BY time_key")?;
            let rows = stmt
                .query_map([topic], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter().map(|body| decode(body)).collect()
        })
        .await
    }

    async fn heads(&self) -> Result<Vec<Cid>, StoreError> {
        self.run(|conn, topic| head_ids(conn, topic)).await
    }

    async fn get_events(&self, cids: &[Cid]) -> Result<Vec<Arc<Event>>, StoreError> {
        let cids = cids.to_vec();
        self.run(move |conn, topic| {
            let mut stmt =
                conn.prepare_cached("SELECT body FROM events WHERE topic = ?1 AND cid = ?2")?;
            let mut found = Vec::with_capacity(cids.len());
            for cid in cids {
                let body: Option<Vec<u8>> = stmt
                    .query_row(params![topic, cid.as_bytes().as_slice()], |row| row.get(0))
                    .optional()?;
                if let Some(body) = body {
                    found.push(decode(&body)?);
                }
            }
            Ok(found)
        })
        .await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.run(|conn, topic| {
            let count: i64 = conn
                .prepare_cached("SELECT COUNT(*) FROM events WHERE topic = ?1")?
                .query_row([topic], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
        .await
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, QueryError> {
        let request = request.clone();
        self.run_with(move |conn, topic| query::run(conn, topic, &request))
            .await
    }
}
