//! Point-in-time restore: head resets and historical forks.
//!
//! Every restore is a single head-pointer update; the WAL is never
//! touched. Entries past the target merely become unreachable through the
//! branch, which keeps audit history intact and makes any reset reversible
//! by re-setting the head forward.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tributary_core::metrics::RESTORE_COUNT;
use tributary_core::{BranchDescriptor, BranchId, CoreError, CoreResult, Lsn};
use tributary_registry::Registry;
use tributary_wal::WalStore;

use crate::materializer::Materializer;
use crate::timetravel::TimeTravel;

/// Read-only impact summary of a prospective reset.
#[derive(Debug, Clone, Serialize)]
pub struct RestorePreview {
    pub branch_id: BranchId,
    pub head_lsn: Lsn,
    pub target_lsn: Lsn,
    /// Branch entries in `(target, head]` that the reset makes
    /// unreachable.
    pub operations_to_unreach: u64,
    /// Collections those entries touch.
    pub affected_collections: BTreeSet<String>,
    /// Collections with live documents at the current head.
    pub current_collections: Vec<String>,
    /// Collections with live documents at the target.
    pub target_collections: Vec<String>,
}

/// Moves branch pointers to historical LSNs.
pub struct RestoreService {
    wal: Arc<WalStore>,
    registry: Arc<Registry>,
    materializer: Arc<Materializer>,
    time_travel: Arc<TimeTravel>,
}

impl RestoreService {
    #[must_use]
    pub fn new(
        wal: Arc<WalStore>,
        registry: Arc<Registry>,
        materializer: Arc<Materializer>,
        time_travel: Arc<TimeTravel>,
    ) -> Self {
        Self {
            wal,
            registry,
            materializer,
            time_travel,
        }
    }

    /// Checks that `target_lsn` is a legal head position for the branch:
    /// at or above the base, at or below the branch's maximum entry LSN
    /// (so a backward reset can be undone by a forward one).
    ///
    /// # Errors
    ///
    /// `NotFound`, `OutOfRange`, `Disabled`, `Storage`, or `Cancelled`.
    pub async fn validate(
        &self,
        branch_id: BranchId,
        target_lsn: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let branch = self.registry.get_branch_by_id(branch_id).await?;
        self.validate_target(&branch, target_lsn, cancel).await
    }

    /// Points the branch head at `target_lsn`, backward or forward.
    /// Atomic: the head either moves or the branch is unchanged.
    ///
    /// # Errors
    ///
    /// As [`validate`](Self::validate).
    pub async fn reset_branch(
        &self,
        branch_id: BranchId,
        target_lsn: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let result = self.reset_inner(branch_id, target_lsn, cancel).await;
        let status = match &result {
            Ok(()) => "ok",
            Err(err) => err.code(),
        };
        RESTORE_COUNT.with_label_values(&["reset", status]).inc();
        result
    }

    async fn reset_inner(
        &self,
        branch_id: BranchId,
        target_lsn: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let branch = self.registry.get_branch_by_id(branch_id).await?;
        self.validate_target(&branch, target_lsn, cancel).await?;
        self.registry.update_head(branch_id, target_lsn, cancel).await?;
        info!(
            branch = %branch.name,
            from = branch.head_lsn.value(),
            to = target_lsn.value(),
            "reset branch head"
        );
        Ok(())
    }

    /// Resolves `timestamp` through the branch's visible history, then
    /// resets the head to the resulting LSN.
    ///
    /// # Errors
    ///
    /// As [`reset_branch`](Self::reset_branch).
    pub async fn reset_branch_to_time(
        &self,
        branch_id: BranchId,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> CoreResult<Lsn> {
        let target = self.time_travel.lsn_at_time(branch_id, timestamp, cancel).await?;
        self.reset_branch(branch_id, target, cancel).await?;
        Ok(target)
    }

    /// Creates a branch anchored at a historical LSN of `source`,
    /// inheriting its visible history up to that point. The new branch's
    /// own base and head are the LSN of its `create_branch` entry.
    ///
    /// # Errors
    ///
    /// `NotFound`, `AlreadyExists`, `Validation`, `OutOfRange`,
    /// `Disabled`, `Storage`, or `Cancelled`.
    pub async fn fork_at_lsn(
        &self,
        source_branch_id: BranchId,
        new_branch_name: &str,
        target_lsn: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<BranchDescriptor> {
        let result = self
            .fork_inner(source_branch_id, new_branch_name, target_lsn, cancel)
            .await;
        let status = match &result {
            Ok(_) => "ok",
            Err(err) => err.code(),
        };
        RESTORE_COUNT.with_label_values(&["fork", status]).inc();
        result
    }

    async fn fork_inner(
        &self,
        source_branch_id: BranchId,
        new_branch_name: &str,
        target_lsn: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<BranchDescriptor> {
        let source = self.registry.get_branch_by_id(source_branch_id).await?;
        let head = self.materializer.effective_head(&source, cancel).await?;
        if target_lsn.is_zero() || target_lsn > head {
            return Err(CoreError::out_of_range(format!(
                "fork point {target_lsn} is outside `{}` history (head {head})",
                source.name
            )));
        }

        let project = self.registry.get_project(source.project_id).await?;
        self.registry
            .create_branch_at(&project, &source, new_branch_name, target_lsn, cancel)
            .await
    }

    /// Computes the impact of a prospective reset without changing
    /// anything.
    ///
    /// # Errors
    ///
    /// As [`validate`](Self::validate).
    pub async fn preview(
        &self,
        branch_id: BranchId,
        target_lsn: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<RestorePreview> {
        let branch = self.registry.get_branch_by_id(branch_id).await?;
        self.validate_target(&branch, target_lsn, cancel).await?;
        let head = branch.head_lsn;

        let unreachable = if target_lsn < head {
            self.wal
                .get_branch_entries(branch_id, target_lsn.next(), head, cancel)
                .await?
        } else {
            Vec::new()
        };
        let affected_collections: BTreeSet<String> = unreachable
            .iter()
            .filter_map(|entry| entry.collection.clone())
            .collect();

        let current = self
            .materializer
            .materialize_branch(branch_id, Some(head), cancel)
            .await?;
        let target = self
            .materializer
            .materialize_branch(branch_id, Some(target_lsn), cancel)
            .await?;

        let mut current_collections: Vec<String> = current.into_keys().collect();
        current_collections.sort();
        let mut target_collections: Vec<String> = target.into_keys().collect();
        target_collections.sort();

        Ok(RestorePreview {
            branch_id,
            head_lsn: head,
            target_lsn,
            operations_to_unreach: unreachable.len() as u64,
            affected_collections,
            current_collections,
            target_collections,
        })
    }

    async fn validate_target(
        &self,
        branch: &BranchDescriptor,
        target_lsn: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        if target_lsn < branch.base_lsn {
            return Err(CoreError::out_of_range(format!(
                "target {target_lsn} is below branch base {}",
                branch.base_lsn
            )));
        }
        let ceiling = self.materializer.effective_head(branch, cancel).await?;
        if target_lsn > ceiling {
            return Err(CoreError::out_of_range(format!(
                "target {target_lsn} is beyond branch history (max {ceiling})"
            )));
        }
        Ok(())
    }
}
