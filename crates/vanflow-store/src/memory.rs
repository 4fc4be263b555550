//! In-memory record store.

use crate::{Entry, Metadata, SourceRef, Store, StoreError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use vanflow_core::{Record, RecordRef, Registry};

/// Unindexed store keeping entries ordered by record identity.
#[derive(Debug)]
pub struct MemoryStore {
    registry: &'static Registry,
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store using the global registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(Registry::global())
    }

    /// Create an empty store merging records through `registry`.
    #[must_use]
    pub fn with_registry(registry: &'static Registry) -> Self {
        Self {
            registry,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a store holding `records`, all attributed to `source`.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = RecordRef>, source: &SourceRef) -> Self {
        let store = Self::new();
        for record in records {
            store.add(record, source.clone());
        }
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn merge(&self, current: &dyn Record, incoming: &dyn Record) -> Result<Option<RecordRef>, StoreError> {
        let before = self.registry.encode(current)?;
        let mut merged = before.clone();
        merged.extend(self.registry.encode(incoming)?);
        if merged == before {
            return Ok(None);
        }
        Ok(Some(self.registry.decode(&merged)?))
    }
}

impl Store for MemoryStore {
    fn list(&self) -> Vec<Entry> {
        self.read().values().cloned().collect()
    }

    fn get(&self, id: &str) -> Option<Entry> {
        self.read().get(id).cloned()
    }

    fn add(&self, record: RecordRef, source: SourceRef) {
        let id = record.identity().to_string();
        self.write().insert(
            id,
            Entry {
                record,
                metadata: Metadata {
                    last_update: Utc::now(),
                    source,
                },
            },
        );
    }

    fn delete(&self, id: &str) -> Option<Entry> {
        self.write().remove(id)
    }

    fn patch(&self, record: RecordRef, source: SourceRef) -> Result<bool, StoreError> {
        let mut entries = self.write();
        let Some(entry) = entries.get_mut(record.identity()) else {
            tracing::trace!(id = record.identity(), source = %source.id, "Store adding record");
            let id = record.identity().to_string();
            entries.insert(
                id,
                Entry {
                    record,
                    metadata: Metadata {
                        last_update: Utc::now(),
                        source,
                    },
                },
            );
            return Ok(true);
        };

        let Some(merged) = self.merge(entry.record.as_ref(), record.as_ref())? else {
            return Ok(false);
        };
        entry.record = merged;
        entry.metadata = Metadata {
            last_update: Utc::now(),
            source,
        };
        Ok(true)
    }

    fn len(&self) -> usize {
        self.read().len()
    }
}
