//! # The records View: Lookup by Type and Id
//!
//! A secondary index keyed both `(type, id)` and `(id, type)`, enabling
//! "get by id", "get by type", and "get by id+type" range scans. Entries
//! store the lseq pointer only - record bytes are lazily loaded through the
//! block cache at query time.
//!
//! By default the `records` query returns current, non-deleted head
//! versions (joined against the kv frontier); `all_versions: true` returns
//! every version of the matching paths in lseq order.

use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{Lseq, SequencedRecord};
use crate::views::View;

/// The records view.
pub struct RecordsView;

/// Arguments of the `records` query.
#[derive(Debug, Default, Deserialize)]
pub struct RecordsArgs {
    /// Restrict to one type.
    #[serde(rename = "type", default)]
    pub typ: Option<String>,
    /// Restrict to one id.
    #[serde(default)]
    pub id: Option<String>,
    /// Return the full version history instead of current heads.
    #[serde(default)]
    pub all_versions: bool,
}

impl View for RecordsView {
    fn name(&self) -> &'static str {
        "records"
    }

    fn map_record(&self, conn: &Connection, record: &SequencedRecord) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO records_view (typ, id, lseq) VALUES (?1, ?2, ?3)",
            params![
                record.version.typ,
                record.version.id,
                record.lseq.as_raw()
            ],
        )?;
        Ok(())
    }

    fn reset(&self, conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM records_view", [])?;
        Ok(())
    }

    fn query_names(&self) -> &'static [&'static str] {
        &["records"]
    }

    fn query(&self, conn: &Connection, _name: &str, args: &Value) -> Result<Vec<Lseq>> {
        let args: RecordsArgs = serde_json::from_value(args.clone())
            .map_err(|e| Error::Invalid(format!("bad records query args: {e}")))?;
        if args.typ.is_none() && args.id.is_none() {
            return Err(Error::Invalid(
                "records query needs a type, an id, or both".to_string(),
            ));
        }

        // Filter clause over the matched paths; bound params depend on
        // which of type/id were given.
        let (clause, params): (&str, Vec<&str>) = match (&args.typ, &args.id) {
            (Some(t), Some(i)) => ("typ = ?1 AND id = ?2", vec![t.as_str(), i.as_str()]),
            (Some(t), None) => ("typ = ?1", vec![t.as_str()]),
            (None, Some(i)) => ("id = ?1", vec![i.as_str()]),
            (None, None) => unreachable!("checked above"),
        };

        let sql = if args.all_versions {
            format!("SELECT lseq FROM records_view WHERE {clause} ORDER BY lseq")
        } else {
            format!(
                "SELECT h.lseq FROM kv_heads h
                 JOIN (SELECT DISTINCT typ, id FROM records_view WHERE {clause}) p
                   ON h.path = p.typ || '!' || p.id
                 WHERE h.deleted = 0
                 ORDER BY h.lseq"
            )
        };

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| r.get::<_, u64>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Lseq::from_raw(row?));
        }
        Ok(out)
    }
}
