//! # The Append-Only Feed Primitive
//!
//! WeftDB is built on top of an external log abstraction: an addressable,
//! append-only, replicated sequence of immutable binary blocks, identified
//! by a public key. Replication itself is out of scope - this module defines
//! the [`Feed`] trait the engine consumes and an in-process implementation,
//! [`MemoryFeed`], used by tests and single-process deployments.
//!
//! ## Availability vs Length
//!
//! With sparse replication a feed's *length* (how many blocks exist) can run
//! ahead of which blocks are *locally available*. `get` therefore returns
//! `None` for a known-but-absent block; [`get_block`] turns that into either
//! an [`Error::NotReady`] or a suspension, depending on the caller's `wait`
//! flag.
//!
//! ## Header Convention
//!
//! Seq 0 of every feed is a [`FeedHeader`] declaring the feed's type and
//! role. It is written at creation time and is not a record.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::codec::{encode_header, FeedHeader};
use crate::error::{Error, Result};
use crate::types::{Address, LogId, Seq};

// =============================================================================
// The Feed Trait
// =============================================================================

/// An append-only, replicated sequence of immutable binary blocks.
///
/// Implementations must be cheap to share (`Send + Sync`); the engine holds
/// them as `Arc<dyn Feed>`. All methods are synchronous - waiting for a
/// not-yet-replicated block is layered on top via [`get_block`] and the
/// [`Feed::updated`] notifier.
pub trait Feed: Send + Sync {
    /// The feed's public key.
    fn key(&self) -> LogId;

    /// Number of blocks known to exist (including the header).
    ///
    /// May run ahead of local availability under sparse replication.
    fn len(&self) -> u64;

    /// True if this process may append to the feed.
    fn writable(&self) -> bool;

    /// Returns the block at `seq`, or `None` if it exists but is not
    /// locally available yet.
    ///
    /// Fails with [`Error::NotFound`] for positions past the feed length.
    fn get(&self, seq: Seq) -> Result<Option<Vec<u8>>>;

    /// Appends blocks, returning the new length.
    ///
    /// Fails with [`Error::NotWritable`] on a non-writable feed.
    fn append(&self, blocks: Vec<Vec<u8>>) -> Result<u64>;

    /// Notified whenever the feed grows or a missing block arrives.
    fn updated(&self) -> &Notify;
}

/// Fetches one block, optionally suspending until it is locally available.
///
/// With `wait = false` a known-but-absent block fails fast with
/// [`Error::NotReady`]; with `wait = true` the call suspends on
/// [`Feed::updated`] until the bytes arrive.
pub async fn get_block(feed: &dyn Feed, seq: Seq, wait: bool) -> Result<Vec<u8>> {
    loop {
        // Register interest before checking, so an arrival between the
        // check and the await cannot be missed.
        let notified = feed.updated().notified();
        if let Some(block) = feed.get(seq)? {
            return Ok(block);
        }
        if !wait {
            return Err(Error::NotReady {
                address: Address::new(feed.key(), seq),
            });
        }
        notified.await;
    }
}

// =============================================================================
// MemoryFeed
// =============================================================================

/// An in-process [`Feed`].
///
/// Two flavors:
/// - [`MemoryFeed::create`]: a locally writable feed with a fresh random
///   key; the header block is written immediately.
/// - [`MemoryFeed::replica`]: a read-only stand-in for a remote feed, fed
///   out-of-band via [`MemoryFeed::announce_len`] and [`MemoryFeed::supply`]
///   (this is how tests exercise `NotReady`).
pub struct MemoryFeed {
    key: LogId,
    writable: bool,
    state: Mutex<FeedState>,
    updated: Notify,
}

struct FeedState {
    /// Slot per known block; `None` = announced but not yet available.
    blocks: Vec<Option<Vec<u8>>>,
}

impl MemoryFeed {
    /// Creates a writable feed with a random key, writing the header at
    /// seq 0.
    pub fn create(header: FeedHeader) -> Result<Self> {
        let key = LogId::from_bytes(rand::random());
        let header_block = encode_header(&header)?;
        Ok(Self {
            key,
            writable: true,
            state: Mutex::new(FeedState {
                blocks: vec![Some(header_block)],
            }),
            updated: Notify::new(),
        })
    }

    /// Creates a read-only replica of a remote feed.
    pub fn replica(key: LogId) -> Self {
        Self {
            key,
            writable: false,
            state: Mutex::new(FeedState { blocks: Vec::new() }),
            updated: Notify::new(),
        }
    }

    /// Announces that the remote feed has grown to `len` blocks, without
    /// supplying their bytes.
    pub fn announce_len(&self, len: u64) {
        let mut state = self.state.lock().expect("feed state poisoned");
        while (state.blocks.len() as u64) < len {
            state.blocks.push(None);
        }
        drop(state);
        self.updated.notify_waiters();
    }

    /// Supplies the bytes for one announced block.
    pub fn supply(&self, seq: Seq, block: Vec<u8>) {
        let mut state = self.state.lock().expect("feed state poisoned");
        let idx = seq.as_raw() as usize;
        while state.blocks.len() <= idx {
            state.blocks.push(None);
        }
        state.blocks[idx] = Some(block);
        drop(state);
        self.updated.notify_waiters();
    }
}

impl Feed for MemoryFeed {
    fn key(&self) -> LogId {
        self.key
    }

    fn len(&self) -> u64 {
        self.state.lock().expect("feed state poisoned").blocks.len() as u64
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn get(&self, seq: Seq) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock().expect("feed state poisoned");
        match state.blocks.get(seq.as_raw() as usize) {
            Some(slot) => Ok(slot.clone()),
            None => Err(Error::NotFound(format!(
                "feed {} has no block at seq {seq}",
                self.key
            ))),
        }
    }

    fn append(&self, blocks: Vec<Vec<u8>>) -> Result<u64> {
        if !self.writable {
            return Err(Error::NotWritable {
                log: Some(self.key),
            });
        }
        let mut state = self.state.lock().expect("feed state poisoned");
        for block in blocks {
            state.blocks.push(Some(block));
        }
        let len = state.blocks.len() as u64;
        drop(state);
        self.updated.notify_waiters();
        Ok(len)
    }

    fn updated(&self) -> &Notify {
        &self.updated
    }
}

/// The default header for collection feeds created by WeftDB itself.
pub fn default_header(role: &str) -> FeedHeader {
    FeedHeader {
        typ: "weftdb/feed@1".to_string(),
        role: Some(role.to_string()),
    }
}

// =============================================================================
// FeedSet
// =============================================================================

/// The live set of feeds a collection is composed of.
///
/// Scan order is NOT defined here: the sequencer walks feeds in the durable
/// registration order kept in the index store, so restarts and re-attachment
/// in a different order cannot change lseq assignment. Shared read-mostly
/// state: a plain `RwLock` suffices since feeds are added rarely and looked
/// up constantly.
#[derive(Default)]
pub struct FeedSet {
    feeds: std::sync::RwLock<Vec<std::sync::Arc<dyn Feed>>>,
}

impl FeedSet {
    /// Creates an empty feed set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a feed. Adding the same key twice is a no-op.
    pub fn add(&self, feed: std::sync::Arc<dyn Feed>) {
        let mut feeds = self.feeds.write().expect("feed set poisoned");
        if !feeds.iter().any(|f| f.key() == feed.key()) {
            feeds.push(feed);
        }
    }

    /// Looks up a feed by key.
    pub fn get(&self, key: &LogId) -> Option<std::sync::Arc<dyn Feed>> {
        self.feeds
            .read()
            .expect("feed set poisoned")
            .iter()
            .find(|f| &f.key() == key)
            .cloned()
    }

    /// All feeds in insertion order.
    pub fn all(&self) -> Vec<std::sync::Arc<dyn Feed>> {
        self.feeds.read().expect("feed set poisoned").clone()
    }

    /// The first locally writable feed - the default destination for new
    /// records.
    pub fn local_writable(&self) -> Option<std::sync::Arc<dyn Feed>> {
        self.feeds
            .read()
            .expect("feed set poisoned")
            .iter()
            .find(|f| f.writable())
            .cloned()
    }
}

// =============================================================================
// Tests
// =============================================================================
