//! # The Commit Coordinator
//!
//! All writes - `put`, `del`, `batch` - funnel through one coordinator
//! holding the collection-wide write lock. The lock serializes the entire
//! resolve-links-then-append sequence: link resolution reads the current
//! head set of each touched path, and that read must not race with another
//! write mutating the same frontier. Reads never take this lock.
//!
//! ## Commit Sequence
//!
//! ```text
//! lock ─► validate ─► resolve links ─► stage blocks ─► append per feed
//!                     (kv frontier +                       │
//!                      batch overlay)                      ▼
//! return versions ◄── wait for kv cursor ◄── notify indexer
//! ```
//!
//! Staging assigns each record its final address up front
//! (`feed.len() + position within the staged group`) - the lock guarantees
//! nobody else appends meanwhile - so records later in the same batch link
//! the heads staged earlier in it, not the stale disk frontier.
//!
//! ## Visibility Guarantee
//!
//! `commit` resolves only after the kv view's cursor has passed the
//! appended blocks: a resolved `put` is visible to any subsequent read
//! that uses `sync`. The wait is bounded by `sync_timeout`.
//!
//! ## Cross-Feed Atomicity
//!
//! Destination selection only ever picks a locally writable feed, and a
//! collection with none fails up front with nothing written. A feed I/O
//! failure mid-flush does not roll back feeds already appended to; the
//! [`Error::PartialCommit`] it surfaces names them. See DESIGN.md.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::codec::{current_time_ms, encode_record};
use crate::error::{Error, Result};
use crate::feed::FeedSet;
use crate::indexer::IndexerHandle;
use crate::registry::Registry;
use crate::store::IndexStore;
use crate::types::{Address, LogId, RecordPath, RecordVersion, Seq};
use crate::views::kv;

// =============================================================================
// Write Operations
// =============================================================================

/// One write intent, before ids, links, and timestamps are assigned.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Create or update a record.
    Put {
        /// Fully-qualified type name.
        typ: String,
        /// Entity id; assigned (uuid) when absent.
        id: Option<String>,
        /// The payload.
        value: serde_json::Value,
    },
    /// Delete a record (a new version with `deleted = true`).
    Del {
        /// Fully-qualified type name.
        typ: String,
        /// Entity id; required for deletes.
        id: String,
    },
}

// =============================================================================
// Coordinator
// =============================================================================

/// Serializes and executes write batches for one collection.
pub struct CommitCoordinator {
    store: IndexStore,
    feeds: Arc<FeedSet>,
    registry: Arc<Registry>,
    indexer: IndexerHandle,
    /// The collection-wide write lock. Tokio's mutex queues waiters FIFO,
    /// so concurrent writers cannot starve each other.
    lock: Mutex<()>,
    sync_timeout: Option<Duration>,
}

impl CommitCoordinator {
    /// Creates the coordinator.
    pub fn new(
        store: IndexStore,
        feeds: Arc<FeedSet>,
        registry: Arc<Registry>,
        indexer: IndexerHandle,
        sync_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            feeds,
            registry,
            indexer,
            lock: Mutex::new(()),
            sync_timeout,
        }
    }

    /// Commits a batch of write intents, returning the committed versions
    /// in op order, each with its assigned address.
    ///
    /// Validation failures abort the whole batch before anything is
    /// appended; the lock is released either way.
    pub async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<RecordVersion>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.lock.lock().await;

        let local = self
            .feeds
            .local_writable()
            .ok_or(Error::NotWritable { log: None })?;

        // Stage: assign addresses, resolve links, encode. Later ops in the
        // batch see the heads staged by earlier ops on the same path.
        let mut next_seq: HashMap<LogId, u64> = HashMap::new();
        let mut staged_heads: HashMap<RecordPath, Vec<Address>> = HashMap::new();
        let mut groups: Vec<(Arc<dyn crate::feed::Feed>, Vec<Vec<u8>>)> = Vec::new();
        let mut versions = Vec::with_capacity(ops.len());

        for op in ops {
            let (typ, id, value, deleted) = match op {
                WriteOp::Put { typ, id, value } => {
                    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
                    (typ, id, Some(value), false)
                }
                WriteOp::Del { typ, id } => (typ, id, None, true),
            };
            if typ.is_empty() {
                return Err(Error::Invalid("record has no type".to_string()));
            }
            if id.is_empty() {
                return Err(Error::Invalid("record has an empty id".to_string()));
            }
            if self.registry.get(&typ).is_none() {
                return Err(Error::Invalid(format!("unknown type {typ}")));
            }

            let path = RecordPath::new(typ.clone(), id.clone());
            let links = match staged_heads.get(&path) {
                Some(staged) => staged.clone(),
                None => {
                    let p = path.clone();
                    self.store
                        .with(move |conn| kv::heads(conn, &p))
                        .await?
                        .into_iter()
                        .map(|h| h.address)
                        .collect()
                }
            };

            // Destination: the local writable feed. Future routing policy
            // may spread by type; groups are already per-feed for that.
            let feed = local.clone();
            let seq = {
                let counter = next_seq.entry(feed.key()).or_insert_with(|| feed.len());
                let seq = *counter;
                *counter += 1;
                Seq::from_raw(seq)
            };
            let address = Address::new(feed.key(), seq);

            let version = RecordVersion {
                typ,
                id,
                value,
                links,
                deleted,
                timestamp: current_time_ms(),
                address,
            };
            let block = encode_record(&version)?;

            staged_heads.insert(path, vec![address]);
            match groups.iter_mut().find(|(f, _)| f.key() == feed.key()) {
                Some((_, blocks)) => blocks.push(block),
                None => groups.push((feed, vec![block])),
            }
            versions.push(version);
        }

        // Append each group as one contiguous run.
        let mut committed: Vec<LogId> = Vec::new();
        for (feed, blocks) in groups {
            match feed.append(blocks) {
                Ok(_) => committed.push(feed.key()),
                Err(e) if committed.is_empty() => return Err(e),
                Err(e) => {
                    return Err(Error::PartialCommit {
                        committed,
                        source: Box::new(e),
                    });
                }
            }
        }

        // Visibility: resolve once the kv view has indexed past our blocks.
        self.indexer.notify();
        bounded(self.sync_timeout, self.indexer.sync("kv")).await??;

        Ok(versions)
    }
}

// =============================================================================
// Bounded Waits
// =============================================================================

/// Applies the collection's sync budget to a wait.
///
/// `None` preserves the unbounded reference behavior; making the bound
/// explicit configuration keeps a stalled view from hanging callers
/// silently.
pub(crate) async fn bounded<T>(
    timeout: Option<Duration>,
    fut: impl std::future::Future<Output = T>,
) -> Result<T> {
    match timeout {
        Some(budget) => tokio::time::timeout(budget, fut)
            .await
            .map_err(|_| Error::SyncTimeout {
                waited_ms: budget.as_millis() as u64,
            }),
        None => Ok(fut.await),
    }
}
