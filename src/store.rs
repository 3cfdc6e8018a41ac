//! # The Durable Index Store
//!
//! One SQLite database per collection holds everything that must survive a
//! restart with exactness: the lseq assignment map, the feed registration
//! order, per-view cursors and derived index tables, and per-subscription
//! cursors. Feeds themselves are the source of truth for record data; this
//! store only ever holds *derived* state plus the ordering assignments.
//!
//! ## Table Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  feeds              blocks                 view_cursors              │
//! │  ┌─────────────┐    ┌─────────────────┐    ┌──────────────────┐      │
//! │  │ log_id (PK) │    │ lseq (PK)       │    │ view (PK)        │      │
//! │  │ position    │    │ log_id, seq     │    │ cursor           │      │
//! │  │ role        │    │ UNIQUE(log,seq) │    └──────────────────┘      │
//! │  └─────────────┘    └─────────────────┘                              │
//! │                                                                      │
//! │  kv_heads            records_view          field_index   history    │
//! │  (path, address)     (typ, id, lseq)       (field, value, (lseq PK)  │
//! │   → lseq, deleted     + (id, typ) index     lseq)                    │
//! │                                                                      │
//! │  subscriptions: (name PK) → cursor                                   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Transaction Discipline
//!
//! A view batch's index mutations and its cursor advance commit in one
//! SQLite transaction. A store failure mid-batch therefore leaves the cursor
//! untouched and the batch is reprocessed on the next drive - replay is
//! at-least-once and, because views are deterministic, idempotent.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::{Address, LogId, Lseq, Seq};

// =============================================================================
// Schema
// =============================================================================

/// Current schema version. Increment on breaking schema changes.
const SCHEMA_VERSION: i64 = 1;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS feeds (
    log_id   TEXT PRIMARY KEY,
    position INTEGER NOT NULL UNIQUE,
    role     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS blocks (
    lseq   INTEGER PRIMARY KEY,
    log_id TEXT NOT NULL,
    seq    INTEGER NOT NULL,
    UNIQUE (log_id, seq)
);

CREATE TABLE IF NOT EXISTS view_cursors (
    view   TEXT PRIMARY KEY,
    cursor INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS kv_heads (
    path    TEXT NOT NULL,
    address TEXT NOT NULL,
    lseq    INTEGER NOT NULL,
    deleted INTEGER NOT NULL,
    PRIMARY KEY (path, address)
);

CREATE TABLE IF NOT EXISTS kv_links (
    path    TEXT NOT NULL,
    address TEXT NOT NULL,
    PRIMARY KEY (path, address)
);

CREATE TABLE IF NOT EXISTS records_view (
    typ  TEXT NOT NULL,
    id   TEXT NOT NULL,
    lseq INTEGER NOT NULL,
    PRIMARY KEY (typ, id, lseq)
);
CREATE INDEX IF NOT EXISTS records_view_by_id ON records_view (id, typ);

CREATE TABLE IF NOT EXISTS field_index (
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    lseq  INTEGER NOT NULL,
    PRIMARY KEY (field, value, lseq)
);

CREATE TABLE IF NOT EXISTS history (
    lseq      INTEGER PRIMARY KEY,
    typ       TEXT NOT NULL,
    id        TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
    name   TEXT PRIMARY KEY,
    cursor INTEGER NOT NULL
);
";

// =============================================================================
// IndexStore
// =============================================================================

/// Shared handle to the collection's SQLite connection.
///
/// rusqlite's `Connection` is `Send` but not `Sync`, so the single
/// connection lives behind an async mutex; each store operation (or whole
/// indexing pass) takes the lock once. This matches the collection's
/// cooperative single-writer model - there is no benefit to connection
/// pooling when one actor owns all index writes.
#[derive(Clone)]
pub struct IndexStore {
    conn: Arc<Mutex<Connection>>,
}

impl IndexStore {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens a private in-memory store (tests, throwaway collections).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(DDL)?;

        let version: Option<i64> = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |r| {
                r.get(0)
            })
            .optional()?;
        match version {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "store schema version {v} does not match supported version {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with exclusive access to the connection.
    pub async fn with<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().await;
        f(&mut conn)
    }
}

// =============================================================================
// Feed Registration (sequencer scan order)
// =============================================================================

/// Registers a feed, preserving first-registration order across restarts.
///
/// Returns the feed's scan position. Re-registering is a no-op.
pub fn register_feed(conn: &Connection, log: &LogId, role: &str) -> Result<u64> {
    let existing: Option<u64> = conn
        .query_row(
            "SELECT position FROM feeds WHERE log_id = ?1",
            params![log.to_hex()],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(position) = existing {
        return Ok(position);
    }
    let position: u64 = conn.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM feeds",
        [],
        |r| r.get(0),
    )?;
    conn.execute(
        "INSERT INTO feeds (log_id, position, role) VALUES (?1, ?2, ?3)",
        params![log.to_hex(), position, role],
    )?;
    Ok(position)
}

/// All registered feeds in scan order.
pub fn feeds_in_order(conn: &Connection) -> Result<Vec<LogId>> {
    let mut stmt = conn.prepare("SELECT log_id FROM feeds ORDER BY position")?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(LogId::from_hex(&row?)?);
    }
    Ok(out)
}

// =============================================================================
// Lseq Assignment Map
// =============================================================================

/// The next unindexed seq of a feed (1 if nothing indexed; seq 0 is the
/// header and never sequenced).
pub fn next_unindexed_seq(conn: &Connection, log: &LogId) -> Result<Seq> {
    let max: Option<u64> = conn
        .query_row(
            "SELECT MAX(seq) FROM blocks WHERE log_id = ?1",
            params![log.to_hex()],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    Ok(match max {
        Some(seq) => Seq::from_raw(seq + 1),
        None => Seq::FIRST_RECORD,
    })
}

/// Assigns the next lseq to a block. The assignment is permanent.
pub fn assign_lseq(conn: &Connection, address: &Address) -> Result<Lseq> {
    let next: u64 = conn.query_row(
        "SELECT COALESCE(MAX(lseq) + 1, 1) FROM blocks",
        [],
        |r| r.get(0),
    )?;
    conn.execute(
        "INSERT INTO blocks (lseq, log_id, seq) VALUES (?1, ?2, ?3)",
        params![next, address.log.to_hex(), address.seq.as_raw()],
    )?;
    Ok(Lseq::from_raw(next))
}

/// The highest assigned lseq (ZERO if nothing indexed yet).
pub fn head_lseq(conn: &Connection) -> Result<Lseq> {
    let max: Option<u64> = conn
        .query_row("SELECT MAX(lseq) FROM blocks", [], |r| r.get(0))
        .optional()?
        .flatten();
    Ok(max.map(Lseq::from_raw).unwrap_or(Lseq::ZERO))
}

/// Resolves an address to its assigned lseq, if indexed.
pub fn lookup_lseq(conn: &Connection, address: &Address) -> Result<Option<Lseq>> {
    let lseq: Option<u64> = conn
        .query_row(
            "SELECT lseq FROM blocks WHERE log_id = ?1 AND seq = ?2",
            params![address.log.to_hex(), address.seq.as_raw()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(lseq.map(Lseq::from_raw))
}

/// Resolves an lseq back to the block address it was assigned to.
pub fn lookup_address(conn: &Connection, lseq: Lseq) -> Result<Option<Address>> {
    let row: Option<(String, u64)> = conn
        .query_row(
            "SELECT log_id, seq FROM blocks WHERE lseq = ?1",
            params![lseq.as_raw()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        Some((log, seq)) => Ok(Some(Address::new(
            LogId::from_hex(&log)?,
            Seq::from_raw(seq),
        ))),
        None => Ok(None),
    }
}

/// Up to `limit` block references with lseq strictly greater than `after`,
/// in lseq order.
pub fn blocks_after(
    conn: &Connection,
    after: Lseq,
    limit: usize,
) -> Result<Vec<(Lseq, Address)>> {
    let mut stmt = conn.prepare(
        "SELECT lseq, log_id, seq FROM blocks WHERE lseq > ?1 ORDER BY lseq LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![after.as_raw(), limit as u64], |r| {
        Ok((r.get::<_, u64>(0)?, r.get::<_, String>(1)?, r.get::<_, u64>(2)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (lseq, log, seq) = row?;
        out.push((
            Lseq::from_raw(lseq),
            Address::new(LogId::from_hex(&log)?, Seq::from_raw(seq)),
        ));
    }
    Ok(out)
}

// =============================================================================
// View Cursors
// =============================================================================

/// A view's durable cursor (ZERO if the view never ran).
pub fn view_cursor(conn: &Connection, view: &str) -> Result<Lseq> {
    let cursor: Option<u64> = conn
        .query_row(
            "SELECT cursor FROM view_cursors WHERE view = ?1",
            params![view],
            |r| r.get(0),
        )
        .optional()?;
    Ok(cursor.map(Lseq::from_raw).unwrap_or(Lseq::ZERO))
}

/// Advances a view's cursor. Callers must run this in the same transaction
/// as the batch's index mutations.
pub fn set_view_cursor(conn: &Connection, view: &str, cursor: Lseq) -> Result<()> {
    conn.execute(
        "INSERT INTO view_cursors (view, cursor) VALUES (?1, ?2)
         ON CONFLICT (view) DO UPDATE SET cursor = excluded.cursor",
        params![view, cursor.as_raw()],
    )?;
    Ok(())
}

// =============================================================================
// Subscription Cursors
// =============================================================================

/// A subscription's durable cursor (ZERO if never acked).
pub fn subscription_cursor(conn: &Connection, name: &str) -> Result<Lseq> {
    let cursor: Option<u64> = conn
        .query_row(
            "SELECT cursor FROM subscriptions WHERE name = ?1",
            params![name],
            |r| r.get(0),
        )
        .optional()?;
    Ok(cursor.map(Lseq::from_raw).unwrap_or(Lseq::ZERO))
}

/// Durably advances a subscription cursor (the ack operation).
pub fn ack_subscription(conn: &Connection, name: &str, cursor: Lseq) -> Result<()> {
    conn.execute(
        "INSERT INTO subscriptions (name, cursor) VALUES (?1, ?2)
         ON CONFLICT (name) DO UPDATE SET cursor = excluded.cursor",
        params![name, cursor.as_raw()],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn log(byte: u8) -> LogId {
        LogId::from_bytes([byte; 32])
    }

    #[tokio::test]
    async fn test_lseq_assignment_is_dense_and_stable() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .with(|conn| {
                let a = assign_lseq(conn, &Address::new(log(1), Seq::from_raw(1)))?;
                let b = assign_lseq(conn, &Address::new(log(2), Seq::from_raw(1)))?;
                let c = assign_lseq(conn, &Address::new(log(1), Seq::from_raw(2)))?;
                assert_eq!(a, Lseq::FIRST);
                assert_eq!(b, Lseq::from_raw(2));
                assert_eq!(c, Lseq::from_raw(3));
                assert_eq!(head_lseq(conn)?, Lseq::from_raw(3));

                // Both directions of the mapping resolve.
                let addr = Address::new(log(2), Seq::from_raw(1));
                assert_eq!(lookup_lseq(conn, &addr)?, Some(Lseq::from_raw(2)));
                assert_eq!(lookup_address(conn, Lseq::from_raw(2))?, Some(addr));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_double_assignment_rejected() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .with(|conn| {
                let addr = Address::new(log(1), Seq::from_raw(1));
                assign_lseq(conn, &addr)?;
                assert!(assign_lseq(conn, &addr).is_err());
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_feed_registration_order_is_stable() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .with(|conn| {
                register_feed(conn, &log(9), "primary")?;
                register_feed(conn, &log(3), "replica")?;
                // Re-registration keeps the original position.
                register_feed(conn, &log(9), "primary")?;
                assert_eq!(feeds_in_order(conn)?, vec![log(9), log(3)]);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocks_after_pagination() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .with(|conn| {
                for seq in 1..=5u64 {
                    assign_lseq(conn, &Address::new(log(1), Seq::from_raw(seq)))?;
                }
                let page = blocks_after(conn, Lseq::from_raw(2), 2)?;
                assert_eq!(page.len(), 2);
                assert_eq!(page[0].0, Lseq::from_raw(3));
                assert_eq!(page[1].0, Lseq::from_raw(4));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cursors_default_to_zero_and_advance() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .with(|conn| {
                assert_eq!(view_cursor(conn, "kv")?, Lseq::ZERO);
                set_view_cursor(conn, "kv", Lseq::from_raw(10))?;
                assert_eq!(view_cursor(conn, "kv")?, Lseq::from_raw(10));

                assert_eq!(subscription_cursor(conn, "sync")?, Lseq::ZERO);
                ack_subscription(conn, "sync", Lseq::from_raw(4))?;
                assert_eq!(subscription_cursor(conn, "sync")?, Lseq::from_raw(4));
                Ok(())
            })
            .await
            .unwrap();
    }
}
