//! Process-wide schema cache with compare-and-swap publish
//!
//! Maps a shard set (keyed by its endpoint description) to the current
//! `SchemaSnapshot`. Snapshots are never mutated in place: a writer fetches
//! the current `Arc`, builds a new definition, and publishes it with
//! [`SchemaStore::set`]. The publish succeeds only if the stored `Arc` is
//! still the one the writer started from; otherwise the writer refetches
//! and retries.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use vellum_core::Endpoints;

use crate::schema::SchemaSnapshot;

/// Shared schema cache
#[derive(Debug, Default)]
pub struct SchemaStore {
    schemas: DashMap<String, Arc<SchemaSnapshot>>,
    stale_publishes: AtomicU64,
}

impl SchemaStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current schema of `endpoints`; an empty schema if none was published
    pub fn get(&self, endpoints: &Endpoints) -> Arc<SchemaSnapshot> {
        self.schemas
            .entry(endpoints.to_string())
            .or_insert_with(|| Arc::new(SchemaSnapshot::default()))
            .value()
            .clone()
    }

    /// Publish `new` if `old` is still current
    ///
    /// The published snapshot gets `old.version + 1`. Returns false if
    /// another writer published first; the caller must refetch.
    pub fn set(&self, endpoints: &Endpoints, old: &Arc<SchemaSnapshot>, new: SchemaSnapshot) -> bool {
        self.swap(endpoints, old, new, "Schema published")
    }

    /// Reset the schema of `endpoints` to empty if `old` is still current
    pub fn drop_schema(&self, endpoints: &Endpoints, old: &Arc<SchemaSnapshot>) -> bool {
        self.swap(endpoints, old, SchemaSnapshot::default(), "Schema dropped")
    }

    fn swap(
        &self,
        endpoints: &Endpoints,
        old: &Arc<SchemaSnapshot>,
        mut new: SchemaSnapshot,
        what: &str,
    ) -> bool {
        new.version = old.version + 1;
        let published = match self.schemas.entry(endpoints.to_string()) {
            Entry::Occupied(mut entry) => {
                if !Arc::ptr_eq(entry.get(), old) {
                    false
                } else {
                    entry.insert(Arc::new(new));
                    true
                }
            }
            Entry::Vacant(entry) => {
                if old.version != 0 {
                    false
                } else {
                    entry.insert(Arc::new(new));
                    true
                }
            }
        };
        if published {
            debug!(target: "vellum::schema", endpoints = %endpoints, version = old.version + 1, "{}", what);
        } else {
            self.stale_publishes.fetch_add(1, Ordering::Relaxed);
        }
        published
    }

    /// Publishes rejected because the caller's snapshot was stale
    pub fn stale_publishes(&self) -> u64 {
        self.stale_publishes.load(Ordering::Relaxed)
    }
}
