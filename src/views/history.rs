//! # The history View: Activity Timeline
//!
//! An append-ordered index over the global lseq stream for activity and
//! timeline queries: "what happened in this collection, in order". Unlike
//! the records view it never filters to heads - superseded and deleted
//! versions are part of the history.

use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{Lseq, SequencedRecord};
use crate::views::View;

/// Default page size for history queries.
const DEFAULT_LIMIT: usize = 100;

/// The history view.
pub struct HistoryView;

/// Arguments of the `history` query.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryArgs {
    /// Return entries with lseq strictly greater than this (0 = from the
    /// beginning).
    #[serde(default)]
    pub from: u64,
    /// Maximum number of entries.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Newest first instead of oldest first.
    #[serde(default)]
    pub reverse: bool,
}

impl View for HistoryView {
    fn name(&self) -> &'static str {
        "history"
    }

    fn map_record(&self, conn: &Connection, record: &SequencedRecord) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO history (lseq, typ, id, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.lseq.as_raw(),
                record.version.typ,
                record.version.id,
                record.version.timestamp
            ],
        )?;
        Ok(())
    }

    fn reset(&self, conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM history", [])?;
        Ok(())
    }

    fn query_names(&self) -> &'static [&'static str] {
        &["history"]
    }

    fn query(&self, conn: &Connection, _name: &str, args: &Value) -> Result<Vec<Lseq>> {
        let args: HistoryArgs = serde_json::from_value(args.clone())
            .map_err(|e| Error::Invalid(format!("bad history query args: {e}")))?;
        let order = if args.reverse { "DESC" } else { "ASC" };
        let sql = format!("SELECT lseq FROM history WHERE lseq > ?1 ORDER BY lseq {order} LIMIT ?2");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![args.from, args.limit.unwrap_or(DEFAULT_LIMIT) as u64],
            |r| r.get::<_, u64>(0),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Lseq::from_raw(row?));
        }
        Ok(out)
    }
}
