//! # The Collection Handle
//!
//! A [`Collection`] is the root object of a WeftDB database: an owned
//! handle bundling the feed set, the index store, the block cache, the
//! indexer task, the commit coordinator, and the query engine. Everything
//! hangs off this one value - there is no global state, and two
//! collections in one process are fully independent.
//!
//! ```no_run
//! # use weftdb::{Collection, CollectionConfig, Registry, TypeSpec, FieldSpec, IndexOpts};
//! # async fn demo() -> weftdb::Result<()> {
//! let mut registry = Registry::new();
//! registry.define(TypeSpec {
//!     namespace: "app".into(),
//!     name: "note".into(),
//!     version: 1,
//!     fields: vec![FieldSpec {
//!         name: "title".into(),
//!         refines: None,
//!         index: IndexOpts { basic: true, search: false },
//!     }],
//! })?;
//!
//! let db = Collection::open_in_memory(registry, CollectionConfig::default()).await?;
//! let put = db.put("app/note@1", serde_json::json!({ "title": "hello" })).await?;
//! let note = db.get("app/note@1", &put.id).await?;
//! assert!(note.is_some());
//! db.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle
//!
//! A collection is usable from the moment `open` returns until `close` is
//! awaited; operations on a closed collection fail with [`Error::Closed`].
//! `close` stops the indexer after its current pass, so it never tears an
//! index transaction.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{BlockCache, DEFAULT_CACHE_CAPACITY};
use crate::error::{Error, Result};
use crate::feed::{default_header, Feed, FeedSet, MemoryFeed};
use crate::indexer::{
    spawn_indexer, IndexerHandle, DEFAULT_BROADCAST_CAPACITY, DEFAULT_VIEW_BATCH_SIZE,
};
use crate::query::{QueryEngine, QueryOpts};
use crate::registry::Registry;
use crate::store::{self, IndexStore};
use crate::subscription::Subscription;
use crate::types::{
    Address, Entity, LogId, Lseq, Record, RecordPath, RecordVersion, SequencedRecord,
};
use crate::versions;
use crate::views::{built_in_views, kv, View};
use crate::writer::{bounded, CommitCoordinator, WriteOp};

// =============================================================================
// Configuration
// =============================================================================

/// Tunables of one collection. `Default` is right for most uses.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Stream entries a view processes per transaction.
    pub view_batch_size: usize,
    /// Block cache capacity, in blocks.
    pub cache_capacity: usize,
    /// Budget for waits on view drains (commit visibility, `sync: true`
    /// queries, `sync()`). `None` waits forever.
    pub sync_timeout: Option<Duration>,
    /// Capacity of the live record broadcast (live queries tail this).
    pub broadcast_capacity: usize,
    /// Create a local writable feed at open. Turn off when the process
    /// attaches its own feeds (e.g. a read-only replica node).
    pub create_primary_feed: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            view_batch_size: DEFAULT_VIEW_BATCH_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            sync_timeout: Some(Duration::from_secs(30)),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            create_primary_feed: true,
        }
    }
}

/// A point-in-time snapshot of a collection's indexing progress.
#[derive(Debug, Clone)]
pub struct CollectionStatus {
    /// Highest assigned lseq.
    pub head: Lseq,
    /// Durable cursor of each view.
    pub view_cursors: Vec<(String, Lseq)>,
    /// Attached feeds with their current lengths (header included).
    pub feeds: Vec<(LogId, u64)>,
}

/// Ways to reference one block for [`Collection::resolve`].
#[derive(Debug, Clone)]
pub enum BlockRef {
    /// By feed position.
    Address(Address),
    /// By position in the collection-wide order.
    Lseq(Lseq),
    /// By record path; resolves to the path's most recent head.
    Path {
        /// Fully-qualified type name.
        typ: String,
        /// Entity id.
        id: String,
    },
}

/// A fully resolved block reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBlock {
    /// Position in the collection-wide order.
    pub lseq: Lseq,
    /// The block's feed position.
    pub address: Address,
}

// =============================================================================
// Collection
// =============================================================================

/// An open WeftDB collection. See the module docs for an overview.
pub struct Collection {
    store: IndexStore,
    feeds: Arc<FeedSet>,
    registry: Arc<Registry>,
    cache: Arc<BlockCache>,
    views: Arc<Vec<Arc<dyn View>>>,
    indexer: IndexerHandle,
    writer: CommitCoordinator,
    queries: QueryEngine,
    sync_timeout: Option<Duration>,
    open: AtomicBool,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Collection {
    /// Opens (or creates) a collection whose index store lives at `path`.
    pub async fn open(
        path: impl AsRef<Path>,
        registry: Registry,
        config: CollectionConfig,
    ) -> Result<Self> {
        Self::with_store(IndexStore::open(path)?, registry, config).await
    }

    /// Opens a collection with an in-memory index store (tests, throwaway
    /// data).
    pub async fn open_in_memory(registry: Registry, config: CollectionConfig) -> Result<Self> {
        Self::with_store(IndexStore::open_in_memory()?, registry, config).await
    }

    async fn with_store(
        store: IndexStore,
        registry: Registry,
        config: CollectionConfig,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        let feeds = Arc::new(FeedSet::new());
        let cache = Arc::new(BlockCache::new(feeds.clone(), config.cache_capacity));
        let views: Arc<Vec<Arc<dyn View>>> = Arc::new(built_in_views(registry.clone()));

        let indexer = spawn_indexer(
            store.clone(),
            feeds.clone(),
            cache.clone(),
            views.as_ref().clone(),
            config.view_batch_size,
            config.broadcast_capacity,
        );
        let writer = CommitCoordinator::new(
            store.clone(),
            feeds.clone(),
            registry.clone(),
            indexer.clone(),
            config.sync_timeout,
        );
        let queries = QueryEngine::new(
            store.clone(),
            cache.clone(),
            registry.clone(),
            indexer.clone(),
            views.clone(),
            config.sync_timeout,
        );

        let collection = Self {
            store,
            feeds,
            registry,
            cache,
            views,
            indexer,
            writer,
            queries,
            sync_timeout: config.sync_timeout,
            open: AtomicBool::new(true),
            watchers: Mutex::new(Vec::new()),
        };

        if config.create_primary_feed {
            let feed = Arc::new(MemoryFeed::create(default_header("primary"))?);
            info!(log = %feed.key(), "created primary feed");
            collection.attach(feed, "primary").await?;
        }
        Ok(collection)
    }

    /// Attaches a feed to the collection. Its records become part of the
    /// collection as the indexer sequences them. Attaching the same feed
    /// twice is a no-op.
    pub async fn add_feed(&self, feed: Arc<dyn Feed>, role: &str) -> Result<()> {
        self.ensure_open()?;
        self.attach(feed, role).await
    }

    async fn attach(&self, feed: Arc<dyn Feed>, role: &str) -> Result<()> {
        let key = feed.key();
        let role = role.to_string();
        // Registration is durable so restart replays keep the original
        // scan order.
        self.store
            .with(move |conn| store::register_feed(conn, &key, &role))
            .await?;
        self.feeds.add(feed.clone());

        // Each feed gets a watcher nudging the indexer when it grows or a
        // missing block arrives.
        let indexer = self.indexer.clone();
        let handle = tokio::spawn(async move {
            loop {
                feed.updated().notified().await;
                indexer.notify();
            }
        });
        self.watchers.lock().expect("watcher list poisoned").push(handle);

        self.indexer.notify();
        Ok(())
    }

    /// Closes the collection. Every subsequent operation fails with
    /// [`Error::Closed`]. Idempotent.
    pub async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.indexer.shutdown().await;
        for watcher in self.watchers.lock().expect("watcher list poisoned").drain(..) {
            watcher.abort();
        }
        info!("collection closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Writes a record with a fresh id, returning the committed version.
    pub async fn put(&self, typ: &str, value: Value) -> Result<RecordVersion> {
        self.put_with_id(typ, None, value).await
    }

    /// Writes a record, updating the entity `id` if given.
    pub async fn put_with_id(
        &self,
        typ: &str,
        id: Option<&str>,
        value: Value,
    ) -> Result<RecordVersion> {
        let versions = self
            .batch(vec![WriteOp::Put {
                typ: typ.to_string(),
                id: id.map(str::to_string),
                value,
            }])
            .await?;
        Ok(versions.into_iter().next().expect("one op yields one version"))
    }

    /// Deletes a record (writes a tombstone version superseding all current
    /// heads).
    pub async fn del(&self, typ: &str, id: &str) -> Result<RecordVersion> {
        let versions = self
            .batch(vec![WriteOp::Del {
                typ: typ.to_string(),
                id: id.to_string(),
            }])
            .await?;
        Ok(versions.into_iter().next().expect("one op yields one version"))
    }

    /// Commits a batch of writes atomically with respect to link
    /// resolution; returns the committed versions in op order.
    pub async fn batch(&self, ops: Vec<WriteOp>) -> Result<Vec<RecordVersion>> {
        self.ensure_open()?;
        self.writer.commit(ops).await
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Reads a record by type and id.
    ///
    /// Returns `None` for a record that never existed. A deleted record is
    /// returned with [`Record::deleted`] true; concurrent heads are all
    /// present and [`Record::conflict`] is true.
    pub async fn get(&self, typ: &str, id: &str) -> Result<Option<Record>> {
        self.ensure_open()?;
        let path = RecordPath::new(typ, id);
        let p = path.clone();
        let heads = self.store.with(move |conn| kv::heads(conn, &p)).await?;
        if heads.is_empty() {
            return Ok(None);
        }
        let mut versions = Vec::with_capacity(heads.len());
        for head in heads {
            versions.push(self.cache.get_record(head.address, false).await?);
        }
        Ok(Some(versions::reduce(path, versions)))
    }

    /// Reads one exact version by address.
    ///
    /// With `wait = false` a known-but-unreplicated block fails fast with
    /// [`Error::NotReady`]; with `wait = true` the call suspends until the
    /// block arrives, bounded by the collection's sync timeout.
    pub async fn get_by_address(&self, address: Address, wait: bool) -> Result<RecordVersion> {
        self.ensure_open()?;
        if wait {
            bounded(self.sync_timeout, self.cache.get_record(address, true)).await?
        } else {
            self.cache.get_record(address, false).await
        }
    }

    /// Resolves a block reference to its full `(lseq, address)` identity.
    ///
    /// An address the sequencer has not woven yet is [`Error::NotReady`]
    /// when the owning feed covers it (the block exists but is either not
    /// locally available or behind a gap), [`Error::NotFound`] otherwise.
    pub async fn resolve(&self, block: BlockRef) -> Result<ResolvedBlock> {
        self.ensure_open()?;
        match block {
            BlockRef::Lseq(lseq) => {
                let address = self
                    .store
                    .with(move |conn| store::lookup_address(conn, lseq))
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("lseq {lseq} is not assigned")))?;
                Ok(ResolvedBlock { lseq, address })
            }
            BlockRef::Address(address) => {
                let lseq = self
                    .store
                    .with(move |conn| store::lookup_lseq(conn, &address))
                    .await?;
                if let Some(lseq) = lseq {
                    return Ok(ResolvedBlock { lseq, address });
                }
                match self.feeds.get(&address.log) {
                    Some(feed) if address.seq.as_raw() < feed.len() => {
                        Err(Error::NotReady { address })
                    }
                    _ => Err(Error::NotFound(format!("block {address} is unknown"))),
                }
            }
            BlockRef::Path { typ, id } => {
                let path = RecordPath::new(typ, id);
                let display = path.to_string();
                let heads = self.store.with(move |conn| kv::heads(conn, &path)).await?;
                heads
                    .into_iter()
                    .max_by_key(|h| h.lseq)
                    .map(|h| ResolvedBlock {
                        lseq: h.lseq,
                        address: h.address,
                    })
                    .ok_or_else(|| Error::NotFound(format!("no record at {display}")))
            }
        }
    }

    /// Reads every current record of an entity, across types.
    pub async fn entity(&self, id: &str) -> Result<Entity> {
        self.ensure_open()?;
        let results = self
            .queries
            .query(
                "records",
                serde_json::json!({ "id": id }),
                QueryOpts::default(),
            )
            .await?;

        let mut records: Vec<Record> = Vec::new();
        for result in results {
            let path = RecordPath::new(result.version.typ.clone(), result.version.id.clone());
            match records.iter_mut().find(|r| r.path == path) {
                Some(record) => record.heads.push(result.version),
                None => records.push(Record {
                    path,
                    heads: vec![result.version],
                }),
            }
        }
        Ok(Entity {
            id: id.to_string(),
            records,
        })
    }

    /// Runs a named query against the view that registered it.
    pub async fn query(
        &self,
        name: &str,
        args: Value,
        opts: QueryOpts,
    ) -> Result<Vec<SequencedRecord>> {
        self.ensure_open()?;
        self.queries.query(name, args, opts).await
    }

    /// Runs a named query as a stream; with `live: true` it stays open and
    /// tails matching records as they commit.
    pub async fn query_stream(
        &self,
        name: &str,
        args: Value,
        opts: QueryOpts,
    ) -> Result<impl Stream<Item = SequencedRecord> + Send + 'static> {
        self.ensure_open()?;
        self.queries.query_stream(name, args, opts).await
    }

    // -------------------------------------------------------------------------
    // Subscriptions, sync, maintenance
    // -------------------------------------------------------------------------

    /// Opens (or resumes) the named durable subscription.
    pub fn subscribe(&self, name: &str) -> Result<Subscription> {
        self.ensure_open()?;
        Ok(Subscription::new(
            name.to_string(),
            self.store.clone(),
            self.cache.clone(),
            self.registry.clone(),
        ))
    }

    /// Drains every view to the sequencer head, returning that head.
    pub async fn sync(&self) -> Result<Lseq> {
        self.ensure_open()?;
        bounded(self.sync_timeout, self.indexer.sync_all()).await?
    }

    /// Drops a view's derived index; it replays from lseq 0 on the next
    /// drive.
    pub async fn reset_view(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.indexer.reset_view(name).await
    }

    /// The collection's type registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// A snapshot of indexing progress.
    pub async fn status(&self) -> Result<CollectionStatus> {
        self.ensure_open()?;
        let names: Vec<&'static str> = self.views.iter().map(|v| v.name()).collect();
        let (head, view_cursors) = self
            .store
            .with(move |conn| {
                let head = store::head_lseq(conn)?;
                let mut cursors = Vec::with_capacity(names.len());
                for name in names {
                    cursors.push((name.to_string(), store::view_cursor(conn, name)?));
                }
                Ok((head, cursors))
            })
            .await?;
        Ok(CollectionStatus {
            head,
            view_cursors,
            feeds: self
                .feeds
                .all()
                .iter()
                .map(|f| (f.key(), f.len()))
                .collect(),
        })
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        // Watcher tasks hold feed Arcs; reap them even when close() was
        // never awaited. The indexer task exits on its own once every
        // handle clone is gone.
        for watcher in self.watchers.lock().expect("watcher list poisoned").drain(..) {
            watcher.abort();
        }
    }
}
