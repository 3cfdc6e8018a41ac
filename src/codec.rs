//! # Record Block Encoding and Decoding
//!
//! This module provides the codec between logical records and the immutable
//! binary blocks appended to feeds.
//!
//! ## Block Format
//!
//! ```text
//! ┌────────────────────────────────┬──────────────────┐
//! │        JSON envelope           │  xxh3-64 trailer │
//! │  {type,id,value,links,...}     │   (8 bytes, LE)  │
//! └────────────────────────────────┴──────────────────┘
//! ```
//!
//! The envelope is self-describing JSON so values stay schema-flexible; the
//! trailer is an integrity checksum over the envelope bytes. Blocks are
//! replicated verbatim between peers and must stay byte-stable, so nothing
//! here is ever re-encoded after append.
//!
//! Seq 0 of every feed is reserved for a [`FeedHeader`] declaring the feed's
//! type and role; it is not a record and the sequencer never assigns it an
//! lseq.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{Address, RecordVersion};

/// Length of the checksum trailer.
const CHECKSUM_LEN: usize = 8;

// =============================================================================
// Wire Envelopes
// =============================================================================

/// The JSON envelope of a record block.
///
/// `links` are address strings (`<hex log>@<seq>`); the block's own address
/// is not stored - it is implied by where the block sits in its feed.
#[derive(Debug, Serialize, Deserialize)]
struct WireRecord {
    #[serde(rename = "type")]
    typ: String,
    id: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    links: Vec<String>,
    #[serde(default)]
    deleted: bool,
    timestamp: u64,
}

/// The header block written at seq 0 of every feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedHeader {
    /// Declared feed type, e.g. `weftdb/feed@1`.
    #[serde(rename = "type")]
    pub typ: String,
    /// The feed's role within the collection, e.g. `primary`.
    #[serde(default)]
    pub role: Option<String>,
}

/// A decoded block: either the feed header or a record version.
#[derive(Debug, Clone)]
pub enum Block {
    /// The seq-0 header.
    Header(FeedHeader),
    /// A record block (seq >= 1).
    Record(RecordVersion),
}

impl Block {
    /// Returns the record, or `None` for a header block.
    pub fn as_record(&self) -> Option<&RecordVersion> {
        match self {
            Block::Record(v) => Some(v),
            Block::Header(_) => None,
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

fn seal(envelope: Vec<u8>) -> Vec<u8> {
    let checksum = xxhash_rust::xxh3::xxh3_64(&envelope);
    let mut block = envelope;
    block.extend_from_slice(&checksum.to_le_bytes());
    block
}

/// Encodes a record version into block bytes.
///
/// The `address` field is not encoded; it is implied by the block's
/// position once appended.
pub fn encode_record(version: &RecordVersion) -> Result<Vec<u8>> {
    let wire = WireRecord {
        typ: version.typ.clone(),
        id: version.id.clone(),
        value: version.value.clone(),
        links: version.links.iter().map(|a| a.to_string()).collect(),
        deleted: version.deleted,
        timestamp: version.timestamp,
    };
    let envelope = serde_json::to_vec(&wire).map_err(|e| Error::Codec(e.to_string()))?;
    Ok(seal(envelope))
}

/// Encodes a feed header into block bytes.
pub fn encode_header(header: &FeedHeader) -> Result<Vec<u8>> {
    let envelope = serde_json::to_vec(header).map_err(|e| Error::Codec(e.to_string()))?;
    Ok(seal(envelope))
}

// =============================================================================
// Decoding
// =============================================================================

fn open(block: &[u8]) -> Result<&[u8]> {
    if block.len() < CHECKSUM_LEN {
        return Err(Error::Codec(format!("block too short: {} bytes", block.len())));
    }
    let (envelope, trailer) = block.split_at(block.len() - CHECKSUM_LEN);
    let stored = u64::from_le_bytes(trailer.try_into().expect("trailer is 8 bytes"));
    let computed = xxhash_rust::xxh3::xxh3_64(envelope);
    if stored != computed {
        return Err(Error::Codec(format!(
            "checksum mismatch: stored {stored:016x}, computed {computed:016x}"
        )));
    }
    Ok(envelope)
}

/// Decodes a record block, attaching the address it was read from.
pub fn decode_record(block: &[u8], address: Address) -> Result<RecordVersion> {
    let envelope = open(block)?;
    let wire: WireRecord =
        serde_json::from_slice(envelope).map_err(|e| Error::Codec(e.to_string()))?;
    let links = wire
        .links
        .iter()
        .map(|s| s.parse())
        .collect::<Result<Vec<Address>>>()
        .map_err(|e| Error::Codec(format!("bad link address: {e}")))?;
    Ok(RecordVersion {
        typ: wire.typ,
        id: wire.id,
        value: wire.value,
        links,
        deleted: wire.deleted,
        timestamp: wire.timestamp,
        address,
    })
}

/// Decodes a feed header block.
pub fn decode_header(block: &[u8]) -> Result<FeedHeader> {
    let envelope = open(block)?;
    serde_json::from_slice(envelope).map_err(|e| Error::Codec(e.to_string()))
}

/// Decodes any block based on its address (seq 0 is always the header).
pub fn decode_block(block: &[u8], address: Address) -> Result<Block> {
    if address.seq.is_header() {
        Ok(Block::Header(decode_header(block)?))
    } else {
        Ok(Block::Record(decode_record(block, address)?))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// Tests
// =============================================================================
