//! # Domain Types for WeftDB
//!
//! This module defines the core types used throughout WeftDB. These types
//! model the record-store domain: feeds, blocks, logical sequence numbers,
//! record versions, and their derived aggregations.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! We use the "newtype pattern" extensively - wrapping primitive types in
//! single-field structs. A [`Seq`] (position within one feed) can never be
//! passed where an [`Lseq`] (position in the collection-wide total order) is
//! expected, even though both are a `u64` underneath.
//!
//! ## Invariants
//!
//! - [`Lseq`]: dense, strictly increasing, assigned once, never reused -
//!   even across restarts, as long as the underlying feeds are unchanged
//! - [`Seq`]: append index within a single feed; seq 0 is always the feed
//!   header, records start at seq 1
//! - [`Address`]: `log@seq`, immutable identity of one written block
//! - [`RecordVersion`]: immutable once appended; deletion is itself a new
//!   version with `deleted = true`

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{Error, Result};

// =============================================================================
// Feed Identification
// =============================================================================

/// The identity of one append-only feed: its 32-byte public key.
///
/// Displayed and parsed as lowercase hex. Cheap to copy and hash; used as
/// the key half of every [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogId([u8; 32]);

impl LogId {
    /// Creates a log id from raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the lowercase hex form used in addresses and the store.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a log id from its hex form.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::NotFound(format!("bad log id: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::NotFound(format!("bad log id length: {s}")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// =============================================================================
// Positions
// =============================================================================

/// An append index within a single feed.
///
/// Seq 0 is reserved for the feed header block; records start at seq 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(u64);

impl Seq {
    /// The header block position.
    pub const HEADER: Seq = Seq(0);

    /// The first record position.
    pub const FIRST_RECORD: Seq = Seq(1);

    /// Creates a Seq from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value for storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// True for the reserved header position.
    pub fn is_header(&self) -> bool {
        self.0 == 0
    }

    /// The next position.
    pub fn next(&self) -> Seq {
        Seq(self.0 + 1)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical sequence number: the collection-wide total order over all
/// record blocks across all feeds.
///
/// # Invariants
///
/// - Dense and strictly increasing; starts at 1 (zero is the "nothing
///   processed yet" cursor sentinel)
/// - Assigned exactly once per `(log, seq)` pair and persisted; never
///   reassigned, even across restarts, as long as feeds never truncate
/// - Two processes observing identical feed prefixes in the same order
///   assign identical lseqs (required for replay-deterministic views)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lseq(u64);

impl Lseq {
    /// Cursor sentinel: nothing processed yet.
    pub const ZERO: Lseq = Lseq(0);

    /// The first assigned lseq.
    pub const FIRST: Lseq = Lseq(1);

    /// Creates an Lseq from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value for storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// The next lseq.
    pub fn next(&self) -> Lseq {
        Lseq(self.0 + 1)
    }
}

impl fmt::Display for Lseq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Addresses
// =============================================================================

/// The immutable identity of one written block: `log@seq`.
///
/// Canonical string form is `<hex log id>@<seq>`, which is also how links
/// are stored on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    /// The feed the block lives in.
    pub log: LogId,
    /// The append index within that feed.
    pub seq: Seq,
}

impl Address {
    /// Creates an address from its parts.
    pub fn new(log: LogId, seq: Seq) -> Self {
        Self { log, seq }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.log, self.seq)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (log, seq) = s
            .split_once('@')
            .ok_or_else(|| Error::NotFound(format!("bad address: {s}")))?;
        let log = LogId::from_hex(log)?;
        let seq: u64 = seq
            .parse()
            .map_err(|_| Error::NotFound(format!("bad address seq: {s}")))?;
        Ok(Address::new(log, Seq::from_raw(seq)))
    }
}

// =============================================================================
// Record Paths
// =============================================================================

/// The entity path a record version belongs to: `(type, id)`.
///
/// All versions sharing a path form one [`Record`]. The path's string form
/// `type!id` is the key the kv view maintains head frontiers under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordPath {
    /// Fully-qualified type name (`namespace/name@version`).
    pub typ: String,
    /// Entity identifier, stable across versions.
    pub id: String,
}

impl RecordPath {
    /// Creates a path from its parts.
    pub fn new(typ: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.typ, self.id)
    }
}

// =============================================================================
// Record Versions
// =============================================================================

/// One immutable, addressed write: the unit of storage.
///
/// A `RecordVersion` captures a value for an entity path at a point in its
/// causal history. `links` names the version addresses this one supersedes;
/// versions not linked by any other current version form the path's head
/// set. Deletion is not destructive: a delete is a new version with
/// `deleted = true` and no value.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordVersion {
    /// Fully-qualified type name (`namespace/name@version`).
    pub typ: String,
    /// Entity identifier, stable across versions.
    pub id: String,
    /// Structured payload; `None` for deletes.
    pub value: Option<Value>,
    /// Addresses of the versions this one causally supersedes.
    pub links: Vec<Address>,
    /// True if this version deletes the entity.
    pub deleted: bool,
    /// Wall-clock timestamp in milliseconds, stamped at commit.
    pub timestamp: u64,
    /// Where this version lives; assigned at append, attached at decode.
    pub address: Address,
}

impl RecordVersion {
    /// Returns the entity path of this version.
    pub fn path(&self) -> RecordPath {
        RecordPath::new(self.typ.clone(), self.id.clone())
    }
}

/// A record version paired with its logical sequence number.
///
/// This is what flows through the view runtime and the subscription stream:
/// the decoded version plus its position in the collection-wide order.
#[derive(Debug, Clone)]
pub struct SequencedRecord {
    /// Position in the collection-wide total order.
    pub lseq: Lseq,
    /// The decoded version.
    pub version: RecordVersion,
}

// =============================================================================
// Derived Aggregations
// =============================================================================

/// All known versions for one entity path, reduced to its current heads.
///
/// Derived, in-memory state - never a source of truth. `heads` holds the
/// versions not superseded by any other current version's links. More than
/// one head means concurrent writes that nobody has merged yet: WeftDB
/// exposes the conflict instead of silently picking a winner.
#[derive(Debug, Clone)]
pub struct Record {
    /// The entity path.
    pub path: RecordPath,
    /// The current head set, in arena insertion order.
    pub heads: Vec<RecordVersion>,
}

impl Record {
    /// True if the head set has more than one member.
    pub fn conflict(&self) -> bool {
        self.heads.len() > 1
    }

    /// The head with the highest timestamp.
    ///
    /// Ties are broken by the lexicographically greatest address string, so
    /// the choice is deterministic across peers.
    pub fn latest(&self) -> Option<&RecordVersion> {
        self.heads
            .iter()
            .max_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.address.to_string().cmp(&b.address.to_string()))
            })
    }

    /// True if the latest head is a delete.
    pub fn deleted(&self) -> bool {
        self.latest().map(|v| v.deleted).unwrap_or(false)
    }
}

/// The union of [`Record`]s across all types sharing one id.
///
/// Cross-type aggregation: a "file" entity may carry both a `file` record
/// and a generic `entity` record under the same id.
#[derive(Debug, Clone)]
pub struct Entity {
    /// The shared entity identifier.
    pub id: String,
    /// One record per type known for this id.
    pub records: Vec<Record>,
}

impl Entity {
    /// Looks up the record for one type, if any.
    pub fn record(&self, typ: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.path.typ == typ)
    }
}

// =============================================================================
// Tests
// =============================================================================
