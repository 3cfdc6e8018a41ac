//! # The Indexer Actor: Logical Sequencer + View Runtime
//!
//! One background task owns the whole indexing pipeline:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Indexer Task                             │
//! │                                                                 │
//! │  Phase A: Sequencing              Phase B: View Driving         │
//! │  ┌─────────────────────┐          ┌─────────────────────────┐   │
//! │  │ scan feeds in       │  blocks  │ per view, per batch:    │   │
//! │  │ registration order, │ ───────► │ resolve via block cache │   │
//! │  │ assign next lseq    │  table   │ map + cursor advance    │   │
//! │  │ to available blocks │          │ in ONE transaction      │   │
//! │  └─────────────────────┘          └─────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//!            ▲ Drive / Sync / ResetView / Shutdown (mpsc)
//! ```
//!
//! Single ownership makes the ordering guarantee easy to state: lseqs are
//! assigned by exactly one task, in the durable feed registration order,
//! to blocks that are locally available, and never reassigned. Commit visibility and
//! `sync` queries are phrased as requests to this actor ("complete a pass,
//! tell me the head you reached"), the teacher pattern for funnelling all
//! mutation through one owner.
//!
//! ## Stalls
//!
//! A feed can announce length ahead of availability; sequencing stops at
//! the first missing block of each feed and resumes when the feed's
//! watcher triggers another drive. A `Sync` request that cannot drain
//! because of such a stall stays pending and is re-checked after every
//! subsequent pass - callers bound the wait with their own timeout.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::feed::FeedSet;
use crate::store::{self, IndexStore};
use crate::types::{Address, Lseq, SequencedRecord};
use crate::views::View;

// =============================================================================
// Configuration
// =============================================================================

/// Default number of stream entries a view processes per transaction.
///
/// Purely a throughput/memory trade-off; no correctness implication.
pub const DEFAULT_VIEW_BATCH_SIZE: usize = 500;

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 256;

/// Capacity of the live record broadcast channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 4096;

// =============================================================================
// Requests
// =============================================================================

enum IndexerRequest {
    /// New blocks may exist; run a pass.
    Drive,
    /// Run passes until the named view (or all views) has drained to the
    /// sequencer head, then reply with that head.
    Sync {
        view: Option<String>,
        reply: oneshot::Sender<Result<Lseq>>,
    },
    /// Drop a view's derived index and cursor; it replays from lseq 0.
    ResetView {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Stop after finishing the current pass.
    Shutdown { reply: oneshot::Sender<()> },
}

// =============================================================================
// Handle
// =============================================================================

/// Cheap-to-clone handle to the indexer task.
#[derive(Clone)]
pub struct IndexerHandle {
    tx: mpsc::Sender<IndexerRequest>,
    cursors: HashMap<&'static str, watch::Receiver<u64>>,
    records_tx: broadcast::Sender<SequencedRecord>,
}

impl IndexerHandle {
    /// Nudges the indexer: new blocks may exist. Never blocks; a full
    /// channel means a drive is already queued.
    pub fn notify(&self) {
        let _ = self.tx.try_send(IndexerRequest::Drive);
    }

    /// Drains the named view to the sequencer head, returning that head.
    pub async fn sync(&self, view: &str) -> Result<Lseq> {
        self.sync_inner(Some(view.to_string())).await
    }

    /// Drains every view to the sequencer head, returning that head.
    pub async fn sync_all(&self) -> Result<Lseq> {
        self.sync_inner(None).await
    }

    async fn sync_inner(&self, view: Option<String>) -> Result<Lseq> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(IndexerRequest::Sync { view, reply })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Resets a view; the next drive replays it from lseq 0.
    pub async fn reset_view(&self, name: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(IndexerRequest::ResetView {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Stops the indexer task, waiting for the current pass to finish.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(IndexerRequest::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// A watch over one view's cursor (raw lseq).
    pub fn cursor(&self, view: &str) -> Option<watch::Receiver<u64>> {
        self.cursors.get(view).cloned()
    }

    /// Subscribes to records as the kv view commits them (live tailing).
    pub fn subscribe_records(&self) -> broadcast::Receiver<SequencedRecord> {
        self.records_tx.subscribe()
    }
}

// =============================================================================
// Spawning
// =============================================================================

/// Spawns the indexer task over the given store, feeds, cache, and views.
pub fn spawn_indexer(
    store: IndexStore,
    feeds: Arc<FeedSet>,
    cache: Arc<BlockCache>,
    views: Vec<Arc<dyn View>>,
    view_batch_size: usize,
    broadcast_capacity: usize,
) -> IndexerHandle {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
    let (records_tx, _) = broadcast::channel(broadcast_capacity.max(1));

    let mut cursor_txs = HashMap::new();
    let mut cursor_rxs = HashMap::new();
    for view in &views {
        let (ctx, crx) = watch::channel(0u64);
        cursor_txs.insert(view.name(), ctx);
        cursor_rxs.insert(view.name(), crx);
    }

    let actor = Indexer {
        store,
        feeds,
        cache,
        views,
        view_batch_size: view_batch_size.max(1),
        cursor_txs,
        records_tx: records_tx.clone(),
        pending_syncs: Vec::new(),
    };
    tokio::spawn(actor.run(rx));

    IndexerHandle {
        tx,
        cursors: cursor_rxs,
        records_tx,
    }
}

// =============================================================================
// The Actor
// =============================================================================

struct Indexer {
    store: IndexStore,
    feeds: Arc<FeedSet>,
    cache: Arc<BlockCache>,
    views: Vec<Arc<dyn View>>,
    view_batch_size: usize,
    cursor_txs: HashMap<&'static str, watch::Sender<u64>>,
    records_tx: broadcast::Sender<SequencedRecord>,
    pending_syncs: Vec<(Option<String>, oneshot::Sender<Result<Lseq>>)>,
}

struct PassOutcome {
    progressed: bool,
    head: Lseq,
    /// Views whose cursor reached `head` this pass.
    drained: Vec<&'static str>,
}

impl Indexer {
    async fn run(mut self, mut rx: mpsc::Receiver<IndexerRequest>) {
        while let Some(request) = rx.recv().await {
            match request {
                IndexerRequest::Drive => {
                    self.drive_to_quiescence().await;
                }
                IndexerRequest::Sync { view, reply } => {
                    self.pending_syncs.push((view, reply));
                    self.drive_to_quiescence().await;
                }
                IndexerRequest::ResetView { name, reply } => {
                    let _ = reply.send(self.reset_view(&name).await);
                    self.drive_to_quiescence().await;
                }
                IndexerRequest::Shutdown { reply } => {
                    let _ = reply.send(());
                    break;
                }
            }
        }
        // Pending syncs resolve as Closed when their senders drop here.
    }

    /// Runs passes until nothing moves, answering sync requests that
    /// drained along the way.
    async fn drive_to_quiescence(&mut self) {
        loop {
            let outcome = match self.run_pass().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Store-level failure: cursors were not advanced, the
                    // pass will be retried on the next drive.
                    warn!(error = %e, "indexing pass failed");
                    return;
                }
            };
            self.answer_syncs(&outcome);
            if !outcome.progressed {
                return;
            }
        }
    }

    fn answer_syncs(&mut self, outcome: &PassOutcome) {
        let mut still_pending = Vec::new();
        for (view, reply) in self.pending_syncs.drain(..) {
            let satisfied = match &view {
                Some(name) => outcome.drained.iter().any(|d| d == name),
                None => self
                    .views
                    .iter()
                    .all(|v| outcome.drained.contains(&v.name())),
            };
            if satisfied {
                let _ = reply.send(Ok(outcome.head));
            } else {
                still_pending.push((view, reply));
            }
        }
        self.pending_syncs = still_pending;
    }

    /// One full pass: sequence every available block, then drive every
    /// view as far as it will go.
    async fn run_pass(&mut self) -> Result<PassOutcome> {
        let mut progressed = false;

        // Phase A: sequencing. Feeds are scanned in their durable
        // registration order, not the order they were attached in this
        // process, so a restart assigns the same lseqs it would have
        // assigned before.
        let attached = self.feeds.all();
        let assigned: usize = self
            .store
            .with(|conn| {
                let mut count = 0;
                for key in store::feeds_in_order(conn)? {
                    let Some(feed) = attached.iter().find(|f| f.key() == key) else {
                        // Registered but not attached this session.
                        continue;
                    };
                    let len = feed.len();
                    let mut seq = store::next_unindexed_seq(conn, &key)?;
                    while seq.as_raw() < len {
                        // Stop at the first locally missing block; the
                        // feed watcher re-drives when it arrives.
                        if feed.get(seq)?.is_none() {
                            break;
                        }
                        let lseq = store::assign_lseq(conn, &Address::new(key, seq))?;
                        debug!(%lseq, log = %key, %seq, "assigned lseq");
                        seq = seq.next();
                        count += 1;
                    }
                }
                Ok(count)
            })
            .await?;
        progressed |= assigned > 0;

        let head = self.store.with(|conn| store::head_lseq(conn)).await?;

        // Phase B: drive each view independently.
        let mut drained = Vec::new();
        for view in self.views.clone() {
            match self.drive_view(view.as_ref(), head).await {
                Ok((advanced, cursor)) => {
                    progressed |= advanced;
                    if cursor >= head {
                        drained.push(view.name());
                    }
                }
                Err(e) => {
                    // This view's batch failed; others still run, and its
                    // cursor was not advanced.
                    warn!(view = view.name(), error = %e, "view drive failed");
                }
            }
        }

        Ok(PassOutcome {
            progressed,
            head,
            drained,
        })
    }

    /// Drives one view to the head in batches. Returns whether anything
    /// advanced and the final cursor.
    async fn drive_view(&self, view: &dyn View, head: Lseq) -> Result<(bool, Lseq)> {
        let name = view.name();
        let mut cursor = self.store.with(|conn| store::view_cursor(conn, name)).await?;
        let mut advanced = false;

        while cursor < head {
            let entries = self
                .store
                .with(|conn| store::blocks_after(conn, cursor, self.view_batch_size))
                .await?;
            if entries.is_empty() {
                break;
            }
            let last = entries.last().expect("non-empty batch").0;

            // Resolve outside the store lock; sequenced blocks are locally
            // available, so a decode failure is permanent - log and skip,
            // the cursor still moves past the block.
            let mut batch = Vec::with_capacity(entries.len());
            for (lseq, address) in entries {
                match self.cache.get_record(address, false).await {
                    Ok(version) => batch.push(SequencedRecord { lseq, version }),
                    Err(e) => {
                        warn!(view = name, %lseq, %address, error = %e,
                              "skipping undecodable block");
                    }
                }
            }

            let view_name = name;
            let applied: Vec<SequencedRecord> = {
                let batch_ref = batch;
                self.store
                    .with(move |conn| {
                        let tx = conn.transaction()?;
                        let mut applied = Vec::with_capacity(batch_ref.len());
                        for record in batch_ref {
                            // A map failure for one record must not abort
                            // the batch for the others.
                            match view.map_record(&tx, &record) {
                                Ok(()) => applied.push(record),
                                Err(e) => {
                                    warn!(view = view_name, lseq = %record.lseq,
                                          error = %e, "view map failed for record");
                                }
                            }
                        }
                        store::set_view_cursor(&tx, view_name, last)?;
                        tx.commit()?;
                        Ok(applied)
                    })
                    .await?
            };

            cursor = last;
            advanced = true;
            if let Some(ctx) = self.cursor_txs.get(name) {
                let _ = ctx.send(cursor.as_raw());
            }
            // The kv view defines commit visibility; its batch commit is
            // the moment a record becomes live.
            if name == "kv" {
                for record in applied {
                    let _ = self.records_tx.send(record);
                }
            }
        }

        Ok((advanced, cursor))
    }

    async fn reset_view(&self, name: &str) -> Result<()> {
        let Some(view) = self.views.iter().find(|v| v.name() == name).cloned() else {
            return Err(Error::NotFound(format!("no view named {name}")));
        };
        let view_name = view.name();
        self.store
            .with(move |conn| {
                let tx = conn.transaction()?;
                view.reset(&tx)?;
                store::set_view_cursor(&tx, view_name, Lseq::ZERO)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        if let Some(ctx) = self.cursor_txs.get(name) {
            let _ = ctx.send(0);
        }
        Ok(())
    }
}
