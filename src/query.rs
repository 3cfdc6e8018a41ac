//! # Query Dispatch
//!
//! Views answer queries by name; this module routes a named query to the
//! view that registered it, resolves the returned lseq pointers to full
//! records through the block cache, and applies the registry's read-path
//! policy: a record whose type this process does not know is logged and
//! dropped rather than surfaced half-decoded.
//!
//! With `sync: true` the dispatch first drains the answering view to the
//! sequencer head (bounded by the collection's `sync_timeout`), giving
//! read-your-writes against that view.
//!
//! `query_stream` additionally supports `live: true`: after the stored
//! results, the stream tails records as the kv view commits them, emitting
//! those the query matches. The live subscription is opened *before* the
//! stored query runs, so records committed in between are not lost; they
//! are deduplicated by lseq instead.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::indexer::IndexerHandle;
use crate::registry::Registry;
use crate::store::{self, IndexStore};
use crate::types::{Lseq, SequencedRecord};
use crate::views::View;
use crate::writer::bounded;

/// Options applying to a single query.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOpts {
    /// Drain the answering view to the sequencer head before querying.
    pub sync: bool,
    /// Keep the stream open and tail matching records as they commit.
    /// Only meaningful for `query_stream`.
    pub live: bool,
}

/// Routes named queries to views and resolves their results.
#[derive(Clone)]
pub struct QueryEngine {
    store: IndexStore,
    cache: Arc<BlockCache>,
    registry: Arc<Registry>,
    indexer: IndexerHandle,
    views: Arc<Vec<Arc<dyn View>>>,
    sync_timeout: Option<Duration>,
}

impl QueryEngine {
    /// Creates the engine over the collection's views.
    pub fn new(
        store: IndexStore,
        cache: Arc<BlockCache>,
        registry: Arc<Registry>,
        indexer: IndexerHandle,
        views: Arc<Vec<Arc<dyn View>>>,
        sync_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            indexer,
            views,
            sync_timeout,
        }
    }

    /// Runs a named query, returning resolved records in the view's order.
    pub async fn query(
        &self,
        name: &str,
        args: Value,
        opts: QueryOpts,
    ) -> Result<Vec<SequencedRecord>> {
        let view = self.find_view(name)?;
        if opts.sync {
            bounded(self.sync_timeout, self.indexer.sync(view.name())).await??;
        }
        let lseqs = self.run_view_query(&view, name, &args).await?;
        self.resolve(lseqs).await
    }

    /// Runs a named query as a stream. With `live: true` the stream stays
    /// open and tails matching records after the stored results.
    pub async fn query_stream(
        &self,
        name: &str,
        args: Value,
        opts: QueryOpts,
    ) -> Result<impl Stream<Item = SequencedRecord> + Send + 'static> {
        let view = self.find_view(name)?;
        if opts.sync {
            bounded(self.sync_timeout, self.indexer.sync(view.name())).await??;
        }

        // Subscribe before the stored query so nothing commits unseen in
        // the gap; overlap is removed by the lseq threshold below.
        let live_rx = opts.live.then(|| self.indexer.subscribe_records());

        let initial = {
            let lseqs = self.run_view_query(&view, name, &args).await?;
            self.resolve(lseqs).await?
        };
        let threshold = initial.iter().map(|r| r.lseq).max().unwrap_or(Lseq::ZERO);
        let stored = stream::iter(initial);

        let Some(rx) = live_rx else {
            return Ok(stored.chain(stream::empty()).boxed());
        };

        let engine = self.clone();
        let live = stream::unfold(
            (rx, engine, view, name.to_string(), args, threshold),
            |(mut rx, engine, view, name, args, threshold)| async move {
                loop {
                    match rx.recv().await {
                        Ok(record) => {
                            if record.lseq <= threshold {
                                continue;
                            }
                            match engine.matches(&view, &name, &args, record.lseq).await {
                                Ok(true) => {
                                    return Some((
                                        record,
                                        (rx, engine, view, name, args, threshold),
                                    ));
                                }
                                Ok(false) => continue,
                                Err(e) => {
                                    warn!(query = %name, error = %e,
                                          "live match check failed, dropping record");
                                    continue;
                                }
                            }
                        }
                        // A lagged tailer skips to the oldest retained
                        // record; at-least-once delivery belongs to
                        // subscriptions, not live queries.
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(query = %name, missed, "live query stream lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );
        Ok(stored.chain(live).boxed())
    }

    fn find_view(&self, query_name: &str) -> Result<Arc<dyn View>> {
        self.views
            .iter()
            .find(|v| v.query_names().contains(&query_name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no view answers query {query_name}")))
    }

    async fn run_view_query(
        &self,
        view: &Arc<dyn View>,
        name: &str,
        args: &Value,
    ) -> Result<Vec<Lseq>> {
        let view = view.clone();
        let name = name.to_string();
        let args = args.clone();
        self.store
            .with(move |conn| view.query(conn, &name, &args))
            .await
    }

    /// True if the query currently includes `lseq` among its results.
    ///
    /// Drains the answering view first: the live broadcast fires when the
    /// kv view commits, which can be before this view has indexed the same
    /// record.
    async fn matches(
        &self,
        view: &Arc<dyn View>,
        name: &str,
        args: &Value,
        lseq: Lseq,
    ) -> Result<bool> {
        bounded(self.sync_timeout, self.indexer.sync(view.name())).await??;
        let lseqs = self.run_view_query(view, name, args).await?;
        Ok(lseqs.contains(&lseq))
    }

    /// Loads records for the given lseqs, applying the read-path type
    /// policy: unknown-type records are logged and dropped.
    async fn resolve(&self, lseqs: Vec<Lseq>) -> Result<Vec<SequencedRecord>> {
        let addresses = self
            .store
            .with(move |conn| {
                let mut out = Vec::with_capacity(lseqs.len());
                for lseq in lseqs {
                    match store::lookup_address(conn, lseq)? {
                        Some(address) => out.push((lseq, address)),
                        // A view can only return assigned lseqs; a missing
                        // row here is store corruption.
                        None => {
                            return Err(Error::Schema(format!(
                                "lseq {lseq} has no block assignment"
                            )))
                        }
                    }
                }
                Ok(out)
            })
            .await?;

        let mut out = Vec::with_capacity(addresses.len());
        for (lseq, address) in addresses {
            // Sequenced blocks are locally available; never wait.
            let version = self.cache.get_record(address, false).await?;
            match self.registry.upcast(&version) {
                Ok(_) => out.push(SequencedRecord { lseq, version }),
                Err(e) => {
                    warn!(%address, typ = %version.typ, error = %e,
                          "dropping record of unknown type");
                }
            }
        }
        Ok(out)
    }
}
