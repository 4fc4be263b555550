//! # vanflow store
//!
//! The boundary between the protocol engine and whatever keeps records.
//!
//! Managers dump a [`Store`] in [`Store::list`] order when a flush is
//! requested. Collectors reconcile incoming records with [`Store::patch`],
//! keyed by record identity and tagged with the source they came from.
//! [`MemoryStore`] is the unindexed reference implementation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use vanflow_core::{DecodeError, EncodeError, RecordRef};

/// Reference to the event source a record was learned from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SourceRef {
    /// Event source ID
    pub id: String,
}

impl SourceRef {
    /// Reference the event source `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Bookkeeping kept alongside each stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// When the record was last added or changed
    pub last_update: DateTime<Utc>,
    /// Source the record came from
    pub source: SourceRef,
}

/// A stored record and its metadata.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Record snapshot
    pub record: RecordRef,
    /// Bookkeeping
    pub metadata: Metadata,
}

/// Record storage used by managers and collectors.
pub trait Store: Send + Sync {
    /// Every entry, in a stable order.
    fn list(&self) -> Vec<Entry>;

    /// Entry with identity `id`.
    fn get(&self, id: &str) -> Option<Entry>;

    /// Insert or replace the entry for `record`'s identity.
    fn add(&self, record: RecordRef, source: SourceRef);

    /// Remove the entry with identity `id`; returns the removed entry.
    fn delete(&self, id: &str) -> Option<Entry>;

    /// Merge a possibly partial record into the store.
    ///
    /// Attributes present in `record` overwrite the stored ones; absent
    /// attributes are kept. Returns whether the store changed.
    ///
    /// # Errors
    ///
    /// Returns error if either record cannot be encoded or the merged
    /// attributes do not decode.
    fn patch(&self, record: RecordRef, source: SourceRef) -> Result<bool, StoreError>;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Whether the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors returned by store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A record could not be encoded for merging
    #[error("store patch encode error: {0}")]
    Encode(#[from] EncodeError),
    /// The merged attributes did not decode
    #[error("store patch decode error: {0}")]
    Decode(#[from] DecodeError),
}
