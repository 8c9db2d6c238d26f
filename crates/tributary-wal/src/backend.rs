//! Durable storage interface for WAL entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tributary_core::{BranchId, CoreResult, Lsn, WalEntry};

/// Persistence layer beneath the WAL store.
///
/// Implementations must guarantee:
/// 1. Atomicity: `persist` writes a whole batch or none of it.
/// 2. Ordering: range reads return entries strictly ascending by LSN.
/// 3. Recoverability: `max_lsn` reflects every previously persisted entry,
///    so a restarted store resumes the sequence without reuse.
#[async_trait]
pub trait WalBackend: Send + Sync {
    /// Persists a batch of entries atomically.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the backing store rejects the batch; the
    /// caller retries the whole batch later.
    async fn persist(&self, entries: &[WalEntry]) -> CoreResult<()>;

    /// Highest LSN present in the store, or `Lsn::ZERO` when empty.
    async fn max_lsn(&self) -> CoreResult<Lsn>;

    /// Entries with `start <= lsn <= end`, ascending.
    async fn load_range(&self, start: Lsn, end: Lsn) -> CoreResult<Vec<WalEntry>>;

    /// Entries tagged to `branch_id` with `start <= lsn <= end`, ascending.
    async fn load_branch_range(
        &self,
        branch_id: BranchId,
        start: Lsn,
        end: Lsn,
    ) -> CoreResult<Vec<WalEntry>>;

    /// Entries targeting `collection` with `start <= lsn <= end`, ascending.
    async fn load_collection_range(
        &self,
        collection: &str,
        start: Lsn,
        end: Lsn,
    ) -> CoreResult<Vec<WalEntry>>;

    /// Highest LSN whose timestamp is `<= timestamp`; ties resolve to the
    /// highest LSN. `Lsn::ZERO` when no entry qualifies.
    async fn lsn_at_or_before(&self, timestamp: DateTime<Utc>) -> CoreResult<Lsn>;

    /// Highest LSN tagged to `branch_id`, or `Lsn::ZERO`.
    async fn max_branch_lsn(&self, branch_id: BranchId) -> CoreResult<Lsn>;

    /// Distinct collection names touched by entries in `[start, end]`.
    async fn collections_in_range(&self, start: Lsn, end: Lsn) -> CoreResult<Vec<String>>;
}
