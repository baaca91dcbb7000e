//! Range + cursor pagination expressed in SQL.
//!
//! `time_key` BLOBs compare bytewise, which is `(timestamp, cid)` order, so
//! the range and the cursor turn into plain comparisons on the indexed
//! column. The cursor check and the page read share one transaction.

use rusqlite::{Connection, params};

use super::decode;
use crate::event::TimeKey;
use crate::query::{Direction, QueryError, QueryPage, QueryRequest};
use crate::store::StoreError;

fn cursor_exists(conn: &Connection, topic: &str, key: &TimeKey) -> Result<bool, StoreError> {
    Ok(conn
        .prepare_cached("SELECT EXISTS(SELECT 1 FROM events WHERE topic = ?1 AND time_key = ?2)")?
        .query_row(params![topic, key.to_bytes().as_slice()], |row| row.get(0))?)
}

/// Evaluate `request` for `topic`.
///
/// # Errors
///
/// Returns [`QueryError::CursorNotFound`] when the cursor is outside the
/// range or not stored, and [`StoreError::CorruptIndex`] (wrapped) when a
/// row's key disagrees with its decoded event.
pub(crate) fn run(
    conn: &mut Connection,
    topic: &str,
    request: &QueryRequest,
) -> Result<QueryPage, QueryError> {
    let tx = conn.transaction().map_err(StoreError::from)?;

    let (mut lower, mut upper) = request.key_bounds();
    let (mut lower_op, mut upper_op) = (">=", "<=");
    if let Some(cursor) = request.cursor {
        let key = cursor.key();
        if !request.contains(&key) || !cursor_exists(&tx, topic, &key)? {
            return Err(QueryError::CursorNotFound {
                timestamp_ns: cursor.timestamp_ns,
                cid: cursor.cid,
            });
        }
        match request.direction {
            Direction::Ascending => (lower, lower_op) = (key, ">"),
            Direction::Descending => (upper, upper_op) = (key, "<"),
        }
    }
    if lower > upper {
        return Ok(QueryPage::default());
    }

    let order = match request.direction {
        Direction::Ascending => "ASC",
        Direction::Descending => "DESC",
    };
    let limit = request
        .page_size()
        .map_or(-1, |size| i64::try_from(size).unwrap_or(i64::MAX));
    let sql = format!(
        "SELECT time_key, body FROM events
         WHERE topic = ?1 AND time_key {lower_op} ?2 AND time_key {upper_op} ?3
         ORDER BY time_key {order}
         LIMIT ?4"
    );

    let rows = {
        let mut stmt = tx.prepare_cached(&sql).map_err(StoreError::from)?;
        let rows = stmt
            .query_map(
                params![
                    topic,
                    lower.to_bytes().as_slice(),
                    upper.to_bytes().as_slice(),
                    limit
                ],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .map_err(StoreError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)?;
        rows
    };
    tx.commit().map_err(StoreError::from)?;

    let mut events = Vec::with_capacity(rows.len());
    for (key, body) in rows {
        let event = decode(&body)?;
        if event.time_key().to_bytes().as_slice() != key.as_slice() {
            return Err(StoreError::CorruptIndex(event.cid()).into());
        }
        events.push(event);
    }

    let cursor = request.next_cursor(&events);
    Ok(QueryPage { events, cursor })
}
