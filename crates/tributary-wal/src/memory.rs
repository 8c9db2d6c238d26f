//! In-memory WAL backend for tests and embedded use.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tributary_core::{BranchId, CoreError, CoreResult, Lsn, WalEntry};

use crate::backend::WalBackend;

/// Keeps entries in a `BTreeMap` keyed by LSN, so range reads come back in
/// order for free. Supports failure injection to exercise the store's
/// wedge/recovery protocol.
#[derive(Clone, Default)]
pub struct MemoryWalBackend {
    entries: Arc<RwLock<BTreeMap<u64, WalEntry>>>,
    fail_persists: Arc<AtomicUsize>,
}

impl MemoryWalBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` persist calls fail with `Storage`.
    pub fn inject_persist_failures(&self, count: usize) {
        self.fail_persists.store(count, Ordering::SeqCst);
    }

    /// Number of persisted entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing has been persisted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl WalBackend for MemoryWalBackend {
    async fn persist(&self, entries: &[WalEntry]) -> CoreResult<()> {
        if self
            .fail_persists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CoreError::storage("injected persist failure"));
        }

        let mut store = self.entries.write();
        for entry in entries {
            store.insert(entry.lsn.value(), entry.clone());
        }
        Ok(())
    }

    async fn max_lsn(&self) -> CoreResult<Lsn> {
        Ok(self
            .entries
            .read()
            .keys()
            .next_back()
            .copied()
            .map_or(Lsn::ZERO, Lsn::new))
    }

    async fn load_range(&self, start: Lsn, end: Lsn) -> CoreResult<Vec<WalEntry>> {
        Ok(self
            .entries
            .read()
            .range(start.value()..=end.value())
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn load_branch_range(
        &self,
        branch_id: BranchId,
        start: Lsn,
        end: Lsn,
    ) -> CoreResult<Vec<WalEntry>> {
        Ok(self
            .entries
            .read()
            .range(start.value()..=end.value())
            .filter(|(_, entry)| entry.branch_id == Some(branch_id))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn load_collection_range(
        &self,
        collection: &str,
        start: Lsn,
        end: Lsn,
    ) -> CoreResult<Vec<WalEntry>> {
        Ok(self
            .entries
            .read()
            .range(start.value()..=end.value())
            .filter(|(_, entry)| entry.collection.as_deref() == Some(collection))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn lsn_at_or_before(&self, timestamp: DateTime<Utc>) -> CoreResult<Lsn> {
        // Wall-clock timestamps are not assumed monotonic; scan for the
        // highest qualifying LSN rather than binary-searching.
        Ok(self
            .entries
            .read()
            .values()
            .filter(|entry| entry.timestamp <= timestamp)
            .map(|entry| entry.lsn)
            .max()
            .unwrap_or(Lsn::ZERO))
    }

    async fn max_branch_lsn(&self, branch_id: BranchId) -> CoreResult<Lsn> {
        Ok(self
            .entries
            .read()
            .values()
            .rev()
            .find(|entry| entry.branch_id == Some(branch_id))
            .map_or(Lsn::ZERO, |entry| entry.lsn))
    }

    async fn collections_in_range(&self, start: Lsn, end: Lsn) -> CoreResult<Vec<String>> {
        let store = self.entries.read();
        let mut names: Vec<String> = store
            .range(start.value()..=end.value())
            .filter_map(|(_, entry)| entry.collection.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::{AppendRequest, Document, DocumentId, ProjectId};

    fn entry(lsn: u64, branch: BranchId, collection: &str) -> WalEntry {
        AppendRequest::insert(
            ProjectId::new(),
            branch,
            collection,
            DocumentId::from_string(format!("doc-{lsn}")),
            Document::new(),
        )
        .into_entry(Lsn::new(lsn), Utc::now())
    }

    #[tokio::test]
    async fn range_reads_are_ordered_and_inclusive() {
        let backend = MemoryWalBackend::new();
        let branch = BranchId::new();
        let entries: Vec<WalEntry> = (1..=5).map(|n| entry(n, branch, "users")).collect();
        backend.persist(&entries).await.unwrap();

        let range = backend
            .load_range(Lsn::new(2), Lsn::new(4))
            .await
            .unwrap();
        assert_eq!(
            range.iter().map(|e| e.lsn.value()).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(backend.max_lsn().await.unwrap(), Lsn::new(5));
    }

    #[tokio::test]
    async fn branch_filter_applies() {
        let backend = MemoryWalBackend::new();
        let a = BranchId::new();
        let b = BranchId::new();
        backend
            .persist(&[entry(1, a, "users"), entry(2, b, "users"), entry(3, a, "users")])
            .await
            .unwrap();

        let only_a = backend
            .load_branch_range(a, Lsn::new(1), Lsn::new(3))
            .await
            .unwrap();
        assert_eq!(
            only_a.iter().map(|e| e.lsn.value()).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(backend.max_branch_lsn(b).await.unwrap(), Lsn::new(2));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = MemoryWalBackend::new();
        backend.inject_persist_failures(1);

        let branch = BranchId::new();
        let batch = vec![entry(1, branch, "users")];
        assert!(backend.persist(&batch).await.is_err());
        assert!(backend.persist(&batch).await.is_ok());
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn time_index_breaks_ties_by_highest_lsn() {
        let backend = MemoryWalBackend::new();
        let branch = BranchId::new();
        let ts = Utc::now();
        let mut first = entry(1, branch, "users");
        let mut second = entry(2, branch, "users");
        first.timestamp = ts;
        second.timestamp = ts;
        backend.persist(&[first, second]).await.unwrap();

        assert_eq!(backend.lsn_at_or_before(ts).await.unwrap(), Lsn::new(2));
        assert_eq!(
            backend
                .lsn_at_or_before(ts - chrono::Duration::seconds(1))
                .await
                .unwrap(),
            Lsn::ZERO
        );
    }
}
