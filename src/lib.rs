//! # WeftDB
//!
//! A peer-to-peer record store built on append-only feeds. Records are
//! immutable versions appended to per-writer logs; a local indexer weaves
//! every attached feed into one total order (the *lseq* stream) and
//! maintains queryable secondary views over it. Concurrent writes to the
//! same record are not resolved by timestamps behind your back - the causal
//! link graph keeps every unmerged head visible until a write supersedes
//! them.
//!
//! ```text
//!  feeds (append-only logs)          one process
//!  ┌──────────┐ ┌──────────┐   ┌─────────────────────────────────┐
//!  │ local    │ │ replica  │──►│ indexer: assign lseq, drive     │
//!  │ writable │ │ read-only│   │ views (kv/records/fields/hist)  │
//!  └────▲─────┘ └──────────┘   │         │                       │
//!       │ append                │         ▼                       │
//!  ┌────┴─────────┐             │ queries, subscriptions,         │
//!  │ commit       │◄────────────│ live streams                    │
//!  │ coordinator  │  visibility └─────────────────────────────────┘
//!  └──────────────┘
//! ```
//!
//! Start with [`Collection`]; the module docs cover each layer.

pub mod api;
pub mod cache;
pub mod codec;
pub mod error;
pub mod feed;
pub mod indexer;
pub mod query;
pub mod registry;
pub mod store;
pub mod subscription;
pub mod types;
pub mod versions;
pub mod views;
pub mod writer;

pub use api::{BlockRef, Collection, CollectionConfig, CollectionStatus, ResolvedBlock};
pub use error::{Error, Result};
pub use feed::{Feed, FeedSet, MemoryFeed};
pub use query::QueryOpts;
pub use registry::{FieldSpec, IndexOpts, Registry, TypeSpec};
pub use subscription::{Pull, Subscription};
pub use types::{
    Address, Entity, LogId, Lseq, Record, RecordPath, RecordVersion, Seq, SequencedRecord,
};
pub use writer::WriteOp;
