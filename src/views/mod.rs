//! # Views: Incrementally-Maintained Secondary Indexes
//!
//! A view consumes the ordered record stream in batches and maintains a
//! derived index in the store, together with a durable cursor marking the
//! highest lseq it has fully processed. Views are independent: each has its
//! own cursor, a slow or resetting view never blocks another, and any view
//! can be rebuilt from lseq 0 at any time because feeds are the source of
//! truth.
//!
//! The built-in views:
//!
//! | View | Index | Registered queries |
//! |------|-------|--------------------|
//! | [`kv`] | per-path current link frontier | `kv` |
//! | [`records`] | `(type,id)` / `(id,type)` -> lseq | `records` |
//! | [`fields`] | declared field value -> lseq | `index` |
//! | [`history`] | lseq-ordered activity log | `history` |
//!
//! Views are constructed as an explicit list at startup
//! ([`built_in_views`]); there is no dynamic registration.
//!
//! ## Failure Semantics
//!
//! `map_record` failing for one record must not poison the batch: the
//! runtime logs the error and moves on. A store-level failure aborts the
//! whole batch transaction without advancing the cursor, so the batch is
//! reprocessed on the next drive.

use std::sync::Arc;

use rusqlite::Connection;
use serde_json::Value;

use crate::error::Result;
use crate::registry::Registry;
use crate::types::{Lseq, SequencedRecord};

pub mod fields;
pub mod history;
pub mod kv;
pub mod records;

// =============================================================================
// The View Trait
// =============================================================================

/// One incrementally-maintained secondary index.
///
/// Implementations mutate only their own tables. `map_record` and `reset`
/// run inside a transaction owned by the view runtime, which also advances
/// the view's cursor in the same transaction.
pub trait View: Send + Sync {
    /// Stable view name; also the cursor key in the store.
    fn name(&self) -> &'static str;

    /// Applies one record's index mutations.
    fn map_record(&self, conn: &Connection, record: &SequencedRecord) -> Result<()>;

    /// Drops the derived index so the view can replay from lseq 0.
    fn reset(&self, conn: &Connection) -> Result<()>;

    /// Query names this view answers.
    fn query_names(&self) -> &'static [&'static str] {
        &[]
    }

    /// Answers a registered query with matching lseqs, in lseq order.
    ///
    /// Only called with a name from [`View::query_names`]. The query engine
    /// resolves the lseqs to records and upcasts them.
    fn query(&self, conn: &Connection, name: &str, args: &Value) -> Result<Vec<Lseq>> {
        let _ = (conn, name, args);
        Ok(Vec::new())
    }
}

/// Constructs the built-in view list.
pub fn built_in_views(registry: Arc<Registry>) -> Vec<Arc<dyn View>> {
    vec![
        Arc::new(kv::KvView),
        Arc::new(records::RecordsView),
        Arc::new(fields::FieldsView::new(registry)),
        Arc::new(history::HistoryView),
    ]
}
