//! Materializer snapshot cache.
//!
//! Keys pair a branch and collection with the exact target LSN, and WAL
//! entries are immutable, so a cached snapshot can never go stale and no
//! invalidation path exists.

use std::collections::HashMap;
use std::sync::Arc;

use moka::future::Cache as MokaCache;
use tributary_core::metrics::MATERIALIZE_CACHE;
use tributary_core::{BranchId, Document, DocumentId, Lsn, SnapshotCacheConfig};

/// Live documents of one collection at one LSN.
pub type CollectionState = HashMap<DocumentId, Document>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SnapshotKey {
    pub branch_id: BranchId,
    pub collection: String,
    pub lsn: Lsn,
}

/// Bounded, TTL'd cache of materialized snapshots; `None` when disabled by
/// configuration.
pub(crate) struct SnapshotCache {
    inner: Option<MokaCache<SnapshotKey, Arc<CollectionState>>>,
}

impl SnapshotCache {
    pub(crate) fn new(config: &SnapshotCacheConfig) -> Self {
        let inner = config.enabled.then(|| {
            MokaCache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl)
                .build()
        });
        Self { inner }
    }

    pub(crate) async fn get(&self, key: &SnapshotKey) -> Option<Arc<CollectionState>> {
        let cache = self.inner.as_ref()?;
        let hit = cache.get(key).await;
        let outcome = if hit.is_some() { "hit" } else { "miss" };
        MATERIALIZE_CACHE.with_label_values(&[outcome]).inc();
        hit
    }

    pub(crate) async fn insert(&self, key: SnapshotKey, state: Arc<CollectionState>) {
        if let Some(cache) = &self.inner {
            cache.insert(key, state).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(lsn: u64) -> SnapshotKey {
        SnapshotKey {
            branch_id: BranchId::new(),
            collection: "users".to_string(),
            lsn: Lsn::new(lsn),
        }
    }

    #[tokio::test]
    async fn disabled_cache_never_hits() {
        let cache = SnapshotCache::new(&SnapshotCacheConfig {
            enabled: false,
            ..SnapshotCacheConfig::default()
        });
        let k = key(1);
        cache.insert(k.clone(), Arc::new(CollectionState::new())).await;
        assert!(cache.get(&k).await.is_none());
    }

    #[tokio::test]
    async fn round_trips_snapshots() {
        let cache = SnapshotCache::new(&SnapshotCacheConfig::default());
        let k = key(7);
        let mut state = CollectionState::new();
        state.insert(DocumentId::from_string("a"), Document::new());
        cache.insert(k.clone(), Arc::new(state)).await;

        let hit = cache.get(&k).await.expect("cached snapshot");
        assert_eq!(hit.len(), 1);
        assert!(cache.get(&key(8)).await.is_none());
    }
}
