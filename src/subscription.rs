//! # Subscriptions: Durable, At-Least-Once Consumption
//!
//! A subscription is a named durable cursor over the lseq stream. `pull`
//! pages records after the cursor without moving it; only an explicit
//! `ack` advances it. A consumer that crashes between pull and ack sees
//! the same page again on restart - delivery is at least once, and
//! consumers are expected to be idempotent.
//!
//! ```text
//! pull(limit) ──► records (cursor, head]     cursor unchanged
//! ack(cursor) ──► durable cursor advance     next pull starts there
//! ```
//!
//! Acking a cursor *behind* the current one rewinds the subscription; this
//! is deliberate and is how a consumer requests a replay.

use std::sync::Arc;

use tracing::warn;

use crate::cache::BlockCache;
use crate::error::Result;
use crate::registry::Registry;
use crate::store::{self, IndexStore};
use crate::types::{Lseq, SequencedRecord};

/// One page of pulled records.
#[derive(Debug)]
pub struct Pull {
    /// The records of this page, in lseq order. Records of unknown type
    /// are dropped (logged) but still covered by `cursor`.
    pub messages: Vec<SequencedRecord>,
    /// Cursor covering everything in this page; pass to [`Subscription::ack`]
    /// once the page is processed.
    pub cursor: Lseq,
    /// True when this page reaches the sequencer head.
    pub finished: bool,
}

/// Handle to one named subscription.
pub struct Subscription {
    name: String,
    store: IndexStore,
    cache: Arc<BlockCache>,
    registry: Arc<Registry>,
}

impl Subscription {
    pub(crate) fn new(
        name: String,
        store: IndexStore,
        cache: Arc<BlockCache>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            name,
            store,
            cache,
            registry,
        }
    }

    /// The subscription's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current durable cursor.
    pub async fn cursor(&self) -> Result<Lseq> {
        let name = self.name.clone();
        self.store
            .with(move |conn| store::subscription_cursor(conn, &name))
            .await
    }

    /// Pulls up to `limit` records after the durable cursor. Does not
    /// advance the cursor.
    pub async fn pull(&self, limit: usize) -> Result<Pull> {
        let name = self.name.clone();
        let (entries, from, head) = self
            .store
            .with(move |conn| {
                let from = store::subscription_cursor(conn, &name)?;
                let entries = store::blocks_after(conn, from, limit.max(1))?;
                let head = store::head_lseq(conn)?;
                Ok((entries, from, head))
            })
            .await?;

        let cursor = entries.last().map(|(lseq, _)| *lseq).unwrap_or(from);
        let mut messages = Vec::with_capacity(entries.len());
        for (lseq, address) in entries {
            // Sequenced blocks are locally available; decode failures are
            // permanent, so the page skips them rather than wedging the
            // subscription.
            let version = match self.cache.get_record(address, false).await {
                Ok(version) => version,
                Err(e) => {
                    warn!(subscription = %self.name, %lseq, %address, error = %e,
                          "skipping undecodable block");
                    continue;
                }
            };
            match self.registry.upcast(&version) {
                Ok(_) => messages.push(SequencedRecord { lseq, version }),
                Err(e) => {
                    warn!(subscription = %self.name, %lseq, typ = %version.typ,
                          error = %e, "dropping record of unknown type");
                }
            }
        }

        Ok(Pull {
            messages,
            cursor,
            finished: cursor >= head,
        })
    }

    /// Durably advances (or rewinds) the cursor. The next `pull` starts
    /// strictly after it.
    pub async fn ack(&self, cursor: Lseq) -> Result<()> {
        let name = self.name.clone();
        self.store
            .with(move |conn| store::ack_subscription(conn, &name, cursor))
            .await
    }
}
