//! Shard registry
//!
//! Maps endpoints to live shards so that every handler opened on the same
//! endpoint shares one `Shard`. Checkouts are cheap: a `ShardSet` only holds
//! `Arc`s to registered shards.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;
use vellum_core::{Endpoint, Endpoints, OpenFlags, VellumError, VellumResult};

use crate::shard::Shard;
use crate::shard_set::ShardSet;

/// Registry of all shards known to the process
#[derive(Debug, Default)]
pub struct ShardRegistry {
    shards: DashMap<Endpoint, Arc<Shard>>,
}

impl ShardRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Check out `endpoints` with the access mode in `flags`
    ///
    /// # Errors
    ///
    /// `ShardNotFound` if a shard is missing and `flags.create` is false.
    pub fn open(&self, endpoints: &Endpoints, flags: OpenFlags) -> VellumResult<ShardSet> {
        if endpoints.is_empty() {
            return Err(VellumError::ShardNotFound(
                "It is expected at least one endpoint".to_string(),
            ));
        }
        let mut shards = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints.iter() {
            let shard = if flags.create {
                self.shards
                    .entry(endpoint.clone())
                    .or_insert_with(|| {
                        info!(target: "vellum::storage", shard = %endpoint, "Created shard");
                        Arc::new(Shard::new(endpoint.clone()))
                    })
                    .value()
                    .clone()
            } else {
                self.shards
                    .get(endpoint)
                    .map(|s| s.value().clone())
                    .ok_or_else(|| VellumError::ShardNotFound(endpoint.to_string()))?
            };
            shards.push(shard);
        }
        Ok(ShardSet::new(endpoints.clone(), shards, flags.writable))
    }

    /// True if `endpoint` has a shard
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.shards.contains_key(endpoint)
    }

    /// Forget a shard; existing checkouts keep their `Arc`
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        self.shards.remove(endpoint).is_some()
    }

    /// Number of registered shards
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// True if no shard is registered
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::DocumentStore;

    #[test]
    fn test_open_read_only_missing_shard_fails() {
        let registry = ShardRegistry::new();
        let err = registry
            .open(&Endpoints::single("missing"), OpenFlags::READ_ONLY)
            .unwrap_err();
        assert!(matches!(err, VellumError::ShardNotFound(_)));
    }

    #[test]
    fn test_checkouts_share_shards() {
        let registry = ShardRegistry::new();
        let eps = Endpoints::single("db");
        let writer = registry.open(&eps, OpenFlags::WRITABLE).unwrap();
        writer.set_metadata("k", b"v", true).unwrap();

        let reader = registry.open(&eps, OpenFlags::READ_ONLY).unwrap();
        assert_eq!(reader.get_metadata("k").unwrap(), b"v".to_vec());
        assert_eq!(registry.len(), 1);
    }
}
