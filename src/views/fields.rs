//! # The fields View: Declared Field-Value Indexes
//!
//! Driven by the `basic` index declarations in the type registry: for every
//! indexed field of a record's type, the field's value is stored as a
//! canonical JSON string mapping to the record's lseq.
//!
//! Queries against a field also match values indexed under any field that
//! *refines* it - the registry expands the lookup over the whole refinement
//! subtree. Results are filtered to current, non-deleted heads via the kv
//! frontier.
//!
//! Fields marked `search` belong to a pluggable full-text view outside this
//! crate; this view ignores them unless they are also `basic`.

use std::sync::Arc;

use rusqlite::{params_from_iter, Connection};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::types::{Lseq, SequencedRecord};
use crate::views::View;

/// The fields view.
pub struct FieldsView {
    registry: Arc<Registry>,
}

impl FieldsView {
    /// Creates the view over the collection's registry.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

/// Arguments of the `index` query.
#[derive(Debug, Deserialize)]
pub struct IndexArgs {
    /// Full field address (`namespace/name@version#field`).
    pub field: String,
    /// Match this exact value (canonical JSON comparison).
    #[serde(default)]
    pub value: Option<Value>,
}

impl View for FieldsView {
    fn name(&self) -> &'static str {
        "fields"
    }

    fn map_record(&self, conn: &Connection, record: &SequencedRecord) -> Result<()> {
        let version = &record.version;
        let Some(value) = &version.value else {
            return Ok(());
        };
        for (field_addr, spec) in self.registry.indexed_fields(&version.typ) {
            if let Some(field_value) = self.registry.field_value(value, &spec.name) {
                conn.execute(
                    "INSERT OR IGNORE INTO field_index (field, value, lseq) VALUES (?1, ?2, ?3)",
                    rusqlite::params![field_addr, field_value.to_string(), record.lseq.as_raw()],
                )?;
            }
        }
        Ok(())
    }

    fn reset(&self, conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM field_index", [])?;
        Ok(())
    }

    fn query_names(&self) -> &'static [&'static str] {
        &["index"]
    }

    fn query(&self, conn: &Connection, _name: &str, args: &Value) -> Result<Vec<Lseq>> {
        let args: IndexArgs = serde_json::from_value(args.clone())
            .map_err(|e| Error::Invalid(format!("bad index query args: {e}")))?;
        if !self.registry.field_exists(&args.field) {
            return Err(Error::NotFound(format!("unknown field {}", args.field)));
        }

        // A parent-field query must also see values stored under refining
        // descendant fields.
        let fields = self.registry.field_with_descendants(&args.field);
        let placeholders = (1..=fields.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut params: Vec<String> = fields;
        let value_clause = match &args.value {
            Some(value) => {
                params.push(value.to_string());
                format!("AND value = ?{}", params.len())
            }
            None => String::new(),
        };

        let sql = format!(
            "SELECT lseq FROM field_index
             WHERE field IN ({placeholders}) {value_clause}
               AND lseq IN (SELECT lseq FROM kv_heads WHERE deleted = 0)
             ORDER BY lseq"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |r| r.get::<_, u64>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Lseq::from_raw(row?));
        }
        Ok(out)
    }
}
