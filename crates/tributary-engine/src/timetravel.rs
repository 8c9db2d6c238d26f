//! Time-travel queries: timestamp-to-LSN mapping and historical reads.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tributary_core::{BranchId, CoreResult, Lsn};
use tributary_registry::Registry;
use tributary_wal::WalStore;

use crate::cache::CollectionState;
use crate::materializer::{admitted, Materializer};

/// Branch summary for time-travel clients.
#[derive(Debug, Clone, Serialize)]
pub struct TimeTravelInfo {
    pub branch_id: BranchId,
    /// Floor of the travel window (`base_lsn`).
    pub earliest_lsn: Lsn,
    /// Ceiling of the travel window (`head_lsn`).
    pub latest_lsn: Lsn,
    pub earliest_time: Option<DateTime<Utc>>,
    pub latest_time: Option<DateTime<Utc>>,
    /// Entries in `[base_lsn, head_lsn]` visible to the branch.
    pub entry_count: u64,
}

/// Maps wall-clock time onto the LSN axis and drives the materializer.
pub struct TimeTravel {
    wal: Arc<WalStore>,
    registry: Arc<Registry>,
    materializer: Arc<Materializer>,
}

impl TimeTravel {
    #[must_use]
    pub fn new(
        wal: Arc<WalStore>,
        registry: Arc<Registry>,
        materializer: Arc<Materializer>,
    ) -> Self {
        Self {
            wal,
            registry,
            materializer,
        }
    }

    /// Summarizes a branch's travel window.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Disabled`, `Storage`, or `Cancelled`.
    pub async fn info(
        &self,
        branch_id: BranchId,
        cancel: &CancellationToken,
    ) -> CoreResult<TimeTravelInfo> {
        let branch = self.registry.get_branch_by_id(branch_id).await?;

        // The base entry may be project-tagged (main's create_project
        // entry); everything after the base that is visible within the
        // window is tagged to the branch itself.
        let base_entry = self
            .wal
            .get_range(branch.base_lsn, branch.base_lsn, cancel)
            .await?
            .into_iter()
            .next();
        let own = self
            .wal
            .get_branch_entries(branch_id, branch.base_lsn, branch.head_lsn, cancel)
            .await?;

        let mut entry_count = own.len() as u64;
        if let Some(entry) = &base_entry {
            if entry.branch_id != Some(branch_id) {
                entry_count += 1;
            }
        }

        let earliest_time = base_entry.as_ref().map(|entry| entry.timestamp);
        let latest_time = own
            .last()
            .map(|entry| entry.timestamp)
            .or(earliest_time);

        Ok(TimeTravelInfo {
            branch_id,
            earliest_lsn: branch.base_lsn,
            latest_lsn: branch.head_lsn,
            earliest_time,
            latest_time,
            entry_count,
        })
    }

    /// Highest LSN visible to the branch (up to its head) whose entry
    /// timestamp is `<= timestamp`; clamps to the `base_lsn` floor.
    /// Wall clocks are not assumed monotonic; ties and reorderings resolve
    /// to the highest qualifying LSN.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Disabled`, `Storage`, or `Cancelled`.
    pub async fn lsn_at_time(
        &self,
        branch_id: BranchId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> CoreResult<Lsn> {
        let branch = self.registry.get_branch_by_id(branch_id).await?;
        let head = branch.head_lsn;
        let windows = self.materializer.visibility_windows(&branch, head).await?;

        let best = self
            .wal
            .get_range(Lsn::new(1), head, cancel)
            .await?
            .iter()
            .filter(|entry| admitted(&windows, entry) || entry.lsn == branch.base_lsn)
            .filter(|entry| entry.timestamp <= timestamp)
            .map(|entry| entry.lsn)
            .max()
            .unwrap_or(Lsn::ZERO);

        Ok(best.max(branch.base_lsn))
    }

    /// Collections touched by entries visible to the branch within
    /// `[start_lsn, end_lsn]`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Disabled`, `Storage`, or `Cancelled`.
    pub async fn modified_collections(
        &self,
        branch_id: BranchId,
        start_lsn: Lsn,
        end_lsn: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<BTreeSet<String>> {
        let branch = self.registry.get_branch_by_id(branch_id).await?;
        let windows = self.materializer.visibility_windows(&branch, end_lsn).await?;

        Ok(self
            .wal
            .get_range(start_lsn, end_lsn, cancel)
            .await?
            .iter()
            .filter(|entry| admitted(&windows, entry))
            .filter_map(|entry| entry.collection.clone())
            .collect())
    }

    /// Materialized collection state at an explicit LSN (or the effective
    /// head when `None`). Delegates to the materializer.
    ///
    /// # Errors
    ///
    /// As the materializer's collection path.
    pub async fn query_at(
        &self,
        branch_id: BranchId,
        collection: &str,
        lsn: Option<Lsn>,
        cancel: &CancellationToken,
    ) -> CoreResult<Arc<CollectionState>> {
        self.materializer
            .materialize_collection(branch_id, collection, lsn, cancel)
            .await
    }

    /// Materialized collection state as of a wall-clock instant.
    ///
    /// # Errors
    ///
    /// As [`query_at`](Self::query_at).
    pub async fn query_at_time(
        &self,
        branch_id: BranchId,
        collection: &str,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> CoreResult<Arc<CollectionState>> {
        let lsn = self.lsn_at_time(branch_id, timestamp, cancel).await?;
        self.query_at(branch_id, collection, Some(lsn), cancel).await
    }
}
