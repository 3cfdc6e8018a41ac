//! # The kv View: Per-Path Link Frontiers
//!
//! The primary indexing view. For every entity path it maintains the
//! *current head set*: the addresses of versions not superseded by any
//! known version's links. The commit coordinator consults it to compute
//! `links` for a new write, and record reads consult it to surface
//! conflict status - which is why commit visibility is defined as "the kv
//! cursor has passed the appended blocks".
//!
//! Two tables:
//! - `kv_heads`: the frontier itself (path, address, lseq, deleted)
//! - `kv_links`: every link ever seen per path, so a version that arrives
//!   *after* the version superseding it is recognized as already-superseded
//!   (feed replication delivers in feed order, not causal order)

use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{Address, Lseq, RecordPath, SequencedRecord};
use crate::views::View;

/// One entry of a path's head frontier.
#[derive(Debug, Clone)]
pub struct HeadEntry {
    /// Address of the head version.
    pub address: Address,
    /// Its logical sequence number.
    pub lseq: Lseq,
    /// True if the head is a delete marker.
    pub deleted: bool,
}

/// The kv view.
pub struct KvView;

impl View for KvView {
    fn name(&self) -> &'static str {
        "kv"
    }

    fn map_record(&self, conn: &Connection, record: &SequencedRecord) -> Result<()> {
        let version = &record.version;
        let path = version.path().to_string();

        // Record the new version's links and evict their targets from the
        // frontier.
        for link in &version.links {
            let link = link.to_string();
            conn.execute(
                "INSERT OR IGNORE INTO kv_links (path, address) VALUES (?1, ?2)",
                params![path, link],
            )?;
            conn.execute(
                "DELETE FROM kv_heads WHERE path = ?1 AND address = ?2",
                params![path, link],
            )?;
        }

        // Superseded-on-arrival: some already-processed version links this
        // address, so it never enters the frontier.
        let superseded: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM kv_links WHERE path = ?1 AND address = ?2",
                params![path, version.address.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        if superseded.is_none() {
            conn.execute(
                "INSERT OR IGNORE INTO kv_heads (path, address, lseq, deleted)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    path,
                    version.address.to_string(),
                    record.lseq.as_raw(),
                    version.deleted
                ],
            )?;
        }
        Ok(())
    }

    fn reset(&self, conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM kv_heads", [])?;
        conn.execute("DELETE FROM kv_links", [])?;
        Ok(())
    }

    fn query_names(&self) -> &'static [&'static str] {
        &["kv"]
    }

    fn query(&self, conn: &Connection, _name: &str, args: &Value) -> Result<Vec<Lseq>> {
        #[derive(Deserialize)]
        struct Args {
            #[serde(rename = "type")]
            typ: String,
            id: String,
        }
        let args: Args = serde_json::from_value(args.clone())
            .map_err(|e| Error::Invalid(format!("bad kv query args: {e}")))?;
        let path = RecordPath::new(args.typ, args.id);
        Ok(heads(conn, &path)?.into_iter().map(|h| h.lseq).collect())
    }
}

/// The current head frontier of one path, in lseq order.
///
/// Includes deleted heads - callers deciding visibility filter those out;
/// the commit coordinator must link them like any other head.
pub fn heads(conn: &Connection, path: &RecordPath) -> Result<Vec<HeadEntry>> {
    let mut stmt = conn.prepare(
        "SELECT address, lseq, deleted FROM kv_heads WHERE path = ?1 ORDER BY lseq",
    )?;
    let rows = stmt.query_map(params![path.to_string()], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?, r.get::<_, bool>(2)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (address, lseq, deleted) = row?;
        out.push(HeadEntry {
            address: address.parse()?,
            lseq: Lseq::from_raw(lseq),
            deleted,
        });
    }
    Ok(out)
}
