//! # Block Cache with Request Coalescing
//!
//! A bounded LRU of decoded blocks keyed by address. Blocks are immutable
//! once written, so cached entries never go stale - the only way out of the
//! cache is LRU eviction.
//!
//! ## Coalescing
//!
//! Under concurrent query load many tasks hit the same hot block. Without
//! coalescing, N concurrent misses would issue N feed reads. Here the first
//! miss registers an in-flight entry and performs the read; the rest
//! subscribe to its completion:
//!
//! ```text
//!  task A ── miss ──► fetch + decode ──► cache ──► broadcast
//!  task B ── miss ──► subscribe ────────────────► recv
//!  task C ── miss ──► subscribe ────────────────► recv
//! ```
//!
//! In-flight entries live outside the LRU, so eviction can never drop a key
//! that has waiters. Waiters are only ever *woken*, never handed a payload:
//! on wake they retry from the top and either hit the freshly cached block
//! or become the new fetcher (observing the real error themselves).
//!
//! ## Cancellation
//!
//! The fetching future can be dropped mid-await - callers wrap `get` in
//! timeouts. Cleanup of the in-flight entry therefore lives in a drop
//! guard, not after the await: a cancelled fetch removes its entry and
//! wakes the waiters exactly like a failed one, so no address is ever left
//! pointing at a fetch that will never finish.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::broadcast;

use crate::codec::{decode_block, Block};
use crate::error::{Error, Result};
use crate::feed::{get_block, FeedSet};
use crate::types::{Address, RecordVersion};

/// Default number of decoded blocks kept in the cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 16 * 1024;

// =============================================================================
// BlockCache
// =============================================================================

/// Content-addressed cache of decoded blocks.
pub struct BlockCache {
    feeds: Arc<FeedSet>,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    lru: LruCache<Address, Arc<Block>>,
    /// Fetches currently in flight. The sender fires (or drops) when the
    /// fetch is over, whatever its outcome; waiters retry from the top.
    inflight: HashMap<Address, broadcast::Sender<()>>,
}

enum Lookup {
    Hit(Arc<Block>),
    Wait(broadcast::Receiver<()>),
    Fetch,
}

impl BlockCache {
    /// Creates a cache over the given feeds.
    pub fn new(feeds: Arc<FeedSet>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            feeds,
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(capacity),
                inflight: HashMap::new(),
            }),
        }
    }

    /// Fetches and decodes one block, consulting the cache first.
    ///
    /// With `wait = true`, suspends until a known-but-absent block arrives;
    /// otherwise fails fast with [`Error::NotReady`].
    pub async fn get(&self, address: Address, wait: bool) -> Result<Arc<Block>> {
        loop {
            let lookup = {
                let mut inner = self.inner.lock().expect("cache poisoned");
                if let Some(block) = inner.lru.get(&address) {
                    Lookup::Hit(block.clone())
                } else if let Some(tx) = inner.inflight.get(&address) {
                    Lookup::Wait(tx.subscribe())
                } else {
                    let (tx, _) = broadcast::channel(1);
                    inner.inflight.insert(address, tx);
                    Lookup::Fetch
                }
            };

            match lookup {
                Lookup::Hit(block) => return Ok(block),
                // Fetch finished (succeeded, failed, or was cancelled):
                // retry from the top either way.
                Lookup::Wait(mut rx) => {
                    let _ = rx.recv().await;
                    continue;
                }
                Lookup::Fetch => return self.fetch(address, wait).await,
            }
        }
    }

    /// Fetches a record block; a header address is rejected.
    pub async fn get_record(&self, address: Address, wait: bool) -> Result<RecordVersion> {
        let block = self.get(address, wait).await?;
        block
            .as_record()
            .cloned()
            .ok_or_else(|| Error::Invalid(format!("block {address} is a feed header, not a record")))
    }

    async fn fetch(&self, address: Address, wait: bool) -> Result<Arc<Block>> {
        // Declared before the await so it runs even when this future is
        // dropped mid-fetch (a caller timeout). On success the block is in
        // the LRU before the guard wakes the waiters.
        let _cleanup = InflightCleanup {
            cache: self,
            address,
        };
        let result = self.fetch_inner(address, wait).await;
        if let Ok(block) = &result {
            self.inner
                .lock()
                .expect("cache poisoned")
                .lru
                .put(address, block.clone());
        }
        result
    }

    async fn fetch_inner(&self, address: Address, wait: bool) -> Result<Arc<Block>> {
        let feed = self
            .feeds
            .get(&address.log)
            .ok_or_else(|| Error::NotFound(format!("unknown feed {}", address.log)))?;
        let bytes = get_block(feed.as_ref(), address.seq, wait).await?;
        Ok(Arc::new(decode_block(&bytes, address)?))
    }

    /// Removes the fetch's in-flight entry and wakes its waiters.
    ///
    /// Runs on every exit from the fetch, including cancellation.
    fn finish_fetch(&self, address: &Address) {
        let tx = {
            let mut inner = self.inner.lock().expect("cache poisoned");
            inner.inflight.remove(address)
        };
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    /// Number of cached entries (not counting in-flight fetches).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache poisoned").lru.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guard tying in-flight cleanup to the fetching future's lifetime.
struct InflightCleanup<'a> {
    cache: &'a BlockCache,
    address: Address,
}

impl Drop for InflightCleanup<'_> {
    fn drop(&mut self) {
        self.cache.finish_fetch(&self.address);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_record;
    use crate::feed::{default_header, Feed, MemoryFeed};
    use crate::types::{LogId, Seq};

    fn sample_record(feed: &MemoryFeed, seq: u64) -> RecordVersion {
        RecordVersion {
            typ: "test/doc@1".into(),
            id: format!("doc-{seq}"),
            value: Some(serde_json::json!({"n": seq})),
            links: vec![],
            deleted: false,
            timestamp: seq,
            address: Address::new(feed.key(), Seq::from_raw(seq)),
        }
    }

    fn feed_with_records(n: u64) -> Arc<MemoryFeed> {
        let feed = Arc::new(MemoryFeed::create(default_header("primary")).unwrap());
        for seq in 1..=n {
            let block = encode_record(&sample_record(&feed, seq)).unwrap();
            feed.append(vec![block]).unwrap();
        }
        feed
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let feed = feed_with_records(1);
        let feeds = Arc::new(FeedSet::new());
        feeds.add(feed.clone());
        let cache = BlockCache::new(feeds, 8);

        let address = Address::new(feed.key(), Seq::from_raw(1));
        assert!(cache.is_empty());
        let record = cache.get_record(address, false).await.unwrap();
        assert_eq!(record.id, "doc-1");
        assert_eq!(cache.len(), 1);

        // Second call is served from cache.
        let again = cache.get_record(address, false).await.unwrap();
        assert_eq!(again, record);
    }

    #[tokio::test]
    async fn test_unknown_feed_is_not_found() {
        let cache = BlockCache::new(Arc::new(FeedSet::new()), 8);
        let address = Address::new(LogId::from_bytes([0x99; 32]), Seq::from_raw(1));
        let err = cache.get(address, false).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_header_rejected_as_record() {
        let feed = feed_with_records(0);
        let feeds = Arc::new(FeedSet::new());
        feeds.add(feed.clone());
        let cache = BlockCache::new(feeds, 8);

        let err = cache
            .get_record(Address::new(feed.key(), Seq::HEADER), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn test_eviction_is_bounded() {
        let feed = feed_with_records(4);
        let feeds = Arc::new(FeedSet::new());
        feeds.add(feed.clone());
        let cache = BlockCache::new(feeds, 2);

        for seq in 1..=4 {
            cache
                .get(Address::new(feed.key(), Seq::from_raw(seq)), false)
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_clears_inflight() {
        let feed = Arc::new(MemoryFeed::replica(LogId::from_bytes([0x42; 32])));
        feed.announce_len(2);
        let feeds = Arc::new(FeedSet::new());
        feeds.add(feed.clone());
        let cache = BlockCache::new(feeds, 8);

        let address = Address::new(feed.key(), Seq::from_raw(1));
        let err = cache.get(address, false).await.unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));

        // The failure did not leave a stuck in-flight entry behind.
        feed.supply(
            Seq::from_raw(1),
            encode_record(&RecordVersion {
                typ: "test/doc@1".into(),
                id: "late".into(),
                value: None,
                links: vec![],
                deleted: false,
                timestamp: 1,
                address,
            })
            .unwrap(),
        );
        let record = cache.get_record(address, false).await.unwrap();
        assert_eq!(record.id, "late");
    }

    #[tokio::test]
    async fn test_cancelled_fetch_releases_inflight_entry() {
        let feed = Arc::new(MemoryFeed::replica(LogId::from_bytes([0x43; 32])));
        feed.announce_len(2);
        let feeds = Arc::new(FeedSet::new());
        feeds.add(feed.clone());
        let cache = Arc::new(BlockCache::new(feeds, 8));

        // A waiting get on an absent block, dropped by a timeout mid-fetch.
        let address = Address::new(feed.key(), Seq::from_raw(1));
        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            cache.get(address, true),
        )
        .await;
        assert!(timed_out.is_err());

        // The address must not stay poisoned: a fast-fail get becomes the
        // new fetcher instead of waiting on the cancelled one.
        let err = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            cache.get(address, false),
        )
        .await
        .expect("get(wait = false) must not hang after a cancelled fetch")
        .unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));

        // And once the block arrives, it is served normally.
        feed.supply(
            Seq::from_raw(1),
            encode_record(&RecordVersion {
                typ: "test/doc@1".into(),
                id: "revived".into(),
                value: None,
                links: vec![],
                deleted: false,
                timestamp: 1,
                address,
            })
            .unwrap(),
        );
        assert_eq!(cache.get_record(address, false).await.unwrap().id, "revived");
    }
}
