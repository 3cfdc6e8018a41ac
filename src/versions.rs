//! # Version DAG and Conflict Detection
//!
//! Every record version names, in its `links`, the addresses of the
//! versions it causally supersedes. The versions for one entity path form a
//! DAG; the *head set* is the subset not superseded by any known version's
//! links. One head means a clean history; two or more mean concurrent
//! writes that nobody has merged - a conflict that WeftDB exposes rather
//! than resolves (there is no last-writer-wins here; callers merge by
//! writing a version linking all current heads).
//!
//! ## Representation
//!
//! Versions live in an arena indexed by insertion order, with a side map
//! from address to arena index; the head set is a set of arena indices.
//! No reference aliasing, no string lookups on the hot path.
//!
//! ## Delivery-Order Independence
//!
//! Replication delivers versions in feed order, not causal order, so a
//! version may arrive before the version it supersedes. `put` handles every
//! interleaving: a new version is current unless *any known* version (head
//! or not) links it, and each of its own links evicts the referenced
//! version from the head set. Re-delivering a known address is a no-op.

use std::collections::{BTreeSet, HashMap};

use crate::types::{Record, RecordPath, RecordVersion};

// =============================================================================
// VersionArena
// =============================================================================

/// The known versions of one entity path, reduced to their head set.
#[derive(Debug, Default)]
pub struct VersionArena {
    versions: Vec<RecordVersion>,
    by_address: HashMap<crate::types::Address, usize>,
    heads: BTreeSet<usize>,
}

impl VersionArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingests one version. Returns `false` if the address was already
    /// known (idempotent no-op: head set and conflict status unchanged).
    pub fn put(&mut self, version: RecordVersion) -> bool {
        if self.by_address.contains_key(&version.address) {
            return false;
        }

        // Superseded-on-arrival: some already-known version links this one.
        // Checking all known versions (not just heads) keeps the outcome
        // independent of delivery order.
        let superseded = self
            .versions
            .iter()
            .any(|v| v.links.contains(&version.address));

        // Each of the new version's links evicts its target from the heads.
        for link in &version.links {
            if let Some(&idx) = self.by_address.get(link) {
                self.heads.remove(&idx);
            }
        }

        let idx = self.versions.len();
        self.by_address.insert(version.address, idx);
        self.versions.push(version);
        if !superseded {
            self.heads.insert(idx);
        }
        true
    }

    /// The current head versions, in arena insertion order.
    pub fn heads(&self) -> Vec<&RecordVersion> {
        self.heads.iter().map(|&i| &self.versions[i]).collect()
    }

    /// True if the head set has more than one member.
    pub fn conflict(&self) -> bool {
        self.heads.len() > 1
    }

    /// Number of known versions.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// True if no versions are known.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Reduces the arena to a [`Record`] for the given path.
    pub fn into_record(self, path: RecordPath) -> Record {
        let heads = self
            .heads
            .iter()
            .map(|&i| self.versions[i].clone())
            .collect();
        Record { path, heads }
    }
}

/// Builds a [`Record`] by folding versions through an arena.
pub fn reduce(path: RecordPath, versions: impl IntoIterator<Item = RecordVersion>) -> Record {
    let mut arena = VersionArena::new();
    for version in versions {
        arena.put(version);
    }
    arena.into_record(path)
}

// =============================================================================
// Tests
// =============================================================================
