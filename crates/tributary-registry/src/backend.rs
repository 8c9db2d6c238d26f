//! Storage interface for project and branch identity rows.

use async_trait::async_trait;
use tributary_core::{BranchDescriptor, BranchId, CoreResult, Lsn, ProjectDescriptor, ProjectId};

/// Persistence beneath the registry.
///
/// Row uniqueness (project `name`; branch `(project_id, name)`) is enforced
/// here, surfacing `AlreadyExists`. `update_branch_head` must be an atomic
/// single-row update: it either lands in full or leaves the row unchanged.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Inserts a project row.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` on a duplicate name, `Storage` otherwise.
    async fn insert_project(&self, project: &ProjectDescriptor) -> CoreResult<()>;

    /// Fetches a project by id.
    async fn project_by_id(&self, project_id: ProjectId) -> CoreResult<Option<ProjectDescriptor>>;

    /// Fetches a project by unique name.
    async fn project_by_name(&self, name: &str) -> CoreResult<Option<ProjectDescriptor>>;

    /// All projects, ordered by creation time.
    async fn list_projects(&self) -> CoreResult<Vec<ProjectDescriptor>>;

    /// Removes a project row (the WAL keeps its tombstone).
    async fn remove_project(&self, project_id: ProjectId) -> CoreResult<()>;

    /// Inserts a branch row.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` on a duplicate `(project, name)` pair.
    async fn insert_branch(&self, branch: &BranchDescriptor) -> CoreResult<()>;

    /// Fetches a branch by id.
    async fn branch_by_id(&self, branch_id: BranchId) -> CoreResult<Option<BranchDescriptor>>;

    /// Fetches a branch by name within a project.
    async fn branch_by_name(
        &self,
        project_id: ProjectId,
        name: &str,
    ) -> CoreResult<Option<BranchDescriptor>>;

    /// All branches of a project, ordered by creation time.
    async fn list_branches(&self, project_id: ProjectId) -> CoreResult<Vec<BranchDescriptor>>;

    /// Atomically points a branch head at `head_lsn`.
    ///
    /// # Errors
    ///
    /// `NotFound` when the branch row is gone.
    async fn update_branch_head(&self, branch_id: BranchId, head_lsn: Lsn) -> CoreResult<()>;

    /// Removes one branch row.
    async fn remove_branch(&self, branch_id: BranchId) -> CoreResult<()>;

    /// Removes every branch row of a project.
    async fn remove_project_branches(&self, project_id: ProjectId) -> CoreResult<()>;
}
