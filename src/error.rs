//! # Error Handling for WeftDB
//!
//! This module defines the error types used throughout WeftDB. We use a single
//! error enum ([`Error`]) to represent all failure modes, which simplifies
//! error handling for library users.
//!
//! ## Error Categories
//!
//! Errors fall into these categories:
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Resolution | `NotFound`, `NotReady` | Fix the reference, or wait and retry |
//! | Validation | `Invalid` | Fix the record before resubmitting |
//! | Commit | `NotWritable`, `PartialCommit` | Check feed ownership / inspect committed feeds |
//! | Internal | `StoreIo`, `Codec` | Log and investigate |
//! | Lifecycle | `Closed`, `SyncTimeout` | Reopen / raise the sync budget |
//!
//! Note that a conflicting record is *not* an error: concurrent heads are
//! surfaced as data on [`Record::conflict`](crate::types::Record::conflict)
//! and it is the caller's job to merge them.

use thiserror::Error;

use crate::types::{Address, LogId};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in WeftDB operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Resolution Errors
    // =========================================================================

    /// A block, record, feed, or query reference could not be resolved.
    ///
    /// The reference is malformed or refers to something this collection has
    /// never heard of. Unlike [`Error::NotReady`], waiting will not help.
    #[error("not found: {0}")]
    NotFound(String),

    /// The reference is valid but the block is not locally available yet.
    ///
    /// Happens with sparsely replicated feeds: the sequencer may know a block
    /// exists (the feed's length covers it) while the bytes have not arrived.
    /// Retryable: call again with `wait = true` or after replication catches
    /// up.
    #[error("block {address} is not locally available yet")]
    NotReady {
        /// The address of the missing block.
        address: Address,
    },

    // =========================================================================
    // Validation Errors
    // =========================================================================

    /// A record failed validation before commit.
    ///
    /// Missing id on delete, missing or unknown type, schema violation.
    /// The whole in-progress batch is aborted; nothing was appended.
    #[error("invalid record: {0}")]
    Invalid(String),

    // =========================================================================
    // Commit Errors
    // =========================================================================

    /// The commit had nowhere to write.
    ///
    /// Either a specific feed rejected an append (`log` names it), or the
    /// collection holds no locally writable feed at all (`log` is `None`).
    #[error("{}", .log.as_ref().map(|l| format!("feed {l} is not writable"))
        .unwrap_or_else(|| "collection has no writable feed".to_string()))]
    NotWritable {
        /// The feed that rejected the append, when one was selected.
        log: Option<LogId>,
    },

    /// A multi-feed flush failed after some feeds were already appended to.
    ///
    /// Destination feeds are validated writable before any append, so this
    /// only arises from feed I/O failing mid-flush. Appends to the listed
    /// feeds are durable and will be indexed; the remaining groups were not
    /// written. See DESIGN.md for the cross-log atomicity policy.
    #[error("flush failed after committing to {committed:?}: {source}")]
    PartialCommit {
        /// Feeds whose groups were appended before the failure.
        committed: Vec<LogId>,
        /// The underlying append failure.
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================

    /// The durable index store (SQLite) failed.
    ///
    /// Fatal to the indexing pass it occurred in: the view cursor is not
    /// advanced, so the batch is reprocessed on the next drive
    /// (at-least-once).
    #[error("index store error: {0}")]
    StoreIo(#[from] rusqlite::Error),

    /// A block could not be decoded (corrupt bytes or checksum mismatch).
    #[error("codec error: {0}")]
    Codec(String),

    /// Index store schema mismatch or internal wiring failure.
    ///
    /// Opening a store written by a newer WeftDB version, or a background
    /// task channel closing unexpectedly.
    #[error("schema error: {0}")]
    Schema(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================

    /// The collection is not open (never opened, closing, or closed).
    #[error("collection is closed")]
    Closed,

    /// A bounded sync wait elapsed before the view caught up.
    ///
    /// Raised by commit visibility waits and `sync: true` queries when
    /// [`CollectionConfig::sync_timeout`](crate::api::CollectionConfig) is
    /// set and a view stalls.
    #[error("sync wait timed out after {waited_ms}ms")]
    SyncTimeout {
        /// How long the caller waited, in milliseconds.
        waited_ms: u64,
    },
}

impl Error {
    /// True if the operation may succeed when retried after waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotReady { .. } | Error::SyncTimeout { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogId, Seq};

    #[test]
    fn test_error_display() {
        let log = LogId::from_bytes([0xab; 32]);
        let not_ready = Error::NotReady {
            address: Address::new(log, Seq::from_raw(7)),
        };
        assert!(not_ready.to_string().contains("@7"));
        assert!(not_ready.to_string().contains("not locally available"));

        let invalid = Error::Invalid("record has no type".to_string());
        assert_eq!(invalid.to_string(), "invalid record: record has no type");

        let rejected = Error::NotWritable { log: Some(log) };
        assert!(rejected.to_string().starts_with("feed "));
        assert!(rejected.to_string().ends_with("is not writable"));
        let no_destination = Error::NotWritable { log: None };
        assert_eq!(
            no_destination.to_string(),
            "collection has no writable feed"
        );

        let timeout = Error::SyncTimeout { waited_ms: 30_000 };
        assert_eq!(timeout.to_string(), "sync wait timed out after 30000ms");
    }

    #[test]
    fn test_retryable_classification() {
        let log = LogId::from_bytes([0x01; 32]);
        assert!(Error::NotReady {
            address: Address::new(log, Seq::from_raw(1)),
        }
        .is_retryable());
        assert!(Error::SyncTimeout { waited_ms: 1 }.is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::Closed.is_retryable());
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::StoreIo(_)));
        assert!(our_err.to_string().contains("index store error"));
    }
}
