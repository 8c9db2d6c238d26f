//! Project/branch registry service.
//!
//! The registry is a materialization of WAL identity events: every
//! lifecycle change appends its entry first and updates the identity rows
//! second, so a lost registry store can be rebuilt from the log
//! ([`Registry::rebuild_from_wal`]). Head updates are serialized per
//! branch; cross-branch operations take branch locks in ascending id order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tributary_core::{
    validate_branch_name, validate_project_name, AppendRequest, BranchDescriptor, BranchId,
    CoreError, CoreResult, Lsn, OperationKind, Payload, ProjectDescriptor, ProjectId, WalEntry,
    MAIN_BRANCH, META_FORK_LSN, META_PARENT_BRANCH,
};
use tributary_wal::WalStore;

use crate::backend::RegistryBackend;

#[derive(Default)]
struct BranchLocks {
    map: Mutex<HashMap<BranchId, Arc<AsyncMutex<()>>>>,
}

impl BranchLocks {
    fn handle(&self, branch_id: BranchId) -> Arc<AsyncMutex<()>> {
        self.map
            .lock()
            .entry(branch_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Maintains `(project, branch)` identity and `(base_lsn, head_lsn)`
/// pointers over a [`RegistryBackend`].
pub struct Registry {
    backend: Arc<dyn RegistryBackend>,
    wal: Arc<WalStore>,
    locks: BranchLocks,
    enabled: bool,
}

impl Registry {
    #[must_use]
    pub fn new(backend: Arc<dyn RegistryBackend>, wal: Arc<WalStore>, enabled: bool) -> Self {
        Self {
            backend,
            wal,
            locks: BranchLocks::default(),
            enabled,
        }
    }

    /// Creates a project and its `main` branch. The `main` branch's base
    /// and head both point at the `create_project` entry.
    ///
    /// # Errors
    ///
    /// `Validation` on a bad name, `AlreadyExists` on a duplicate,
    /// `Disabled`, `Storage`, or `Cancelled`.
    pub async fn create_project(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<ProjectDescriptor> {
        self.ensure_enabled()?;
        validate_project_name(name)?;
        if self.backend.project_by_name(name).await?.is_some() {
            return Err(CoreError::already_exists("project", name));
        }

        let project_id = ProjectId::new();
        let main_branch_id = BranchId::new();
        let request = AppendRequest::project_op(
            project_id,
            OperationKind::CreateProject,
            json!({
                "name": name,
                "project_id": project_id.to_string(),
                "main_branch_id": main_branch_id.to_string(),
            }),
        );
        let ack = self.wal.append(request, cancel).await?;

        let project = ProjectDescriptor {
            project_id,
            name: name.to_string(),
            main_branch_id,
            created_at: ack.timestamp,
        };
        let main = BranchDescriptor {
            branch_id: main_branch_id,
            project_id,
            name: MAIN_BRANCH.to_string(),
            base_lsn: ack.lsn,
            head_lsn: ack.lsn,
            fork_lsn: None,
            parent_branch_id: None,
            created_at: ack.timestamp,
        };
        self.backend.insert_project(&project).await?;
        self.backend.insert_branch(&main).await?;

        info!(project = name, lsn = ack.lsn.value(), "created project");
        Ok(project)
    }

    /// Creates a branch from a live parent (default `main`), forked at the
    /// parent's current head.
    ///
    /// # Errors
    ///
    /// `NotFound` for the project or parent, `AlreadyExists` on a duplicate
    /// name, `Validation`, `Disabled`, `Storage`, or `Cancelled`.
    pub async fn create_branch(
        &self,
        project_id: ProjectId,
        name: &str,
        parent_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> CoreResult<BranchDescriptor> {
        self.ensure_enabled()?;
        let project = self.get_project(project_id).await?;
        let parent = self
            .get_branch(project_id, parent_name.unwrap_or(MAIN_BRANCH))
            .await?;
        self.create_branch_at(&project, &parent, name, parent.head_lsn, cancel)
            .await
    }

    /// Creates a branch anchored at an explicit LSN of `parent`'s visible
    /// history. The new branch's base and head are the LSN of its own
    /// `create_branch` entry; `fork_lsn` records the inherited cutoff.
    ///
    /// The restore service uses this for `fork_at_lsn`; `create_branch`
    /// passes the parent's live head.
    ///
    /// # Errors
    ///
    /// As [`create_branch`](Self::create_branch), plus `OutOfRange` when
    /// `fork_lsn` is zero or beyond the current log end.
    pub async fn create_branch_at(
        &self,
        project: &ProjectDescriptor,
        parent: &BranchDescriptor,
        name: &str,
        fork_lsn: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<BranchDescriptor> {
        self.ensure_enabled()?;
        validate_branch_name(name)?;
        if fork_lsn.is_zero() || fork_lsn > self.wal.current_lsn() {
            return Err(CoreError::out_of_range(format!(
                "fork point {fork_lsn} is outside the log (current {})",
                self.wal.current_lsn()
            )));
        }
        if self
            .backend
            .branch_by_name(project.project_id, name)
            .await?
            .is_some()
        {
            return Err(CoreError::already_exists("branch", name));
        }

        let branch_id = BranchId::new();
        let request = AppendRequest::project_op(
            project.project_id,
            OperationKind::CreateBranch,
            json!({ "name": name }),
        )
        .on_branch(branch_id)
        .with_metadata(META_PARENT_BRANCH, parent.branch_id.to_string())
        .with_metadata(META_FORK_LSN, fork_lsn.value().to_string());
        let ack = self.wal.append(request, cancel).await?;

        let branch = BranchDescriptor {
            branch_id,
            project_id: project.project_id,
            name: name.to_string(),
            base_lsn: ack.lsn,
            head_lsn: ack.lsn,
            fork_lsn: Some(fork_lsn),
            parent_branch_id: Some(parent.branch_id),
            created_at: ack.timestamp,
        };
        self.backend.insert_branch(&branch).await?;

        info!(
            project = %project.name,
            branch = name,
            parent = %parent.name,
            fork_lsn = fork_lsn.value(),
            lsn = ack.lsn.value(),
            "created branch"
        );
        Ok(branch)
    }

    /// Points a branch head at `new_head`, forward (interceptor) or
    /// backward (restore). Serialized per branch.
    ///
    /// # Errors
    ///
    /// `NotFound`, `OutOfRange` (`new_head < base_lsn` or beyond the log),
    /// `Disabled`, `Storage`, or `Cancelled`.
    pub async fn update_head(
        &self,
        branch_id: BranchId,
        new_head: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        self.ensure_enabled()?;
        let _guard = self.lock_branch(branch_id, cancel).await?;
        let branch = self.get_branch_by_id(branch_id).await?;

        if new_head < branch.base_lsn {
            return Err(CoreError::out_of_range(format!(
                "head {new_head} would fall below branch base {}",
                branch.base_lsn
            )));
        }
        if new_head > self.wal.current_lsn() {
            return Err(CoreError::out_of_range(format!(
                "head {new_head} is beyond the log end {}",
                self.wal.current_lsn()
            )));
        }

        self.backend.update_branch_head(branch_id, new_head).await?;
        debug!(branch = %branch.name, head = new_head.value(), "updated branch head");
        Ok(())
    }

    /// Fetches a project by id.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Disabled`, or `Storage`.
    pub async fn get_project(&self, project_id: ProjectId) -> CoreResult<ProjectDescriptor> {
        self.ensure_enabled()?;
        self.backend
            .project_by_id(project_id)
            .await?
            .ok_or_else(|| CoreError::not_found("project", project_id.to_string()))
    }

    /// Fetches a project by unique name.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Disabled`, or `Storage`.
    pub async fn get_project_by_name(&self, name: &str) -> CoreResult<ProjectDescriptor> {
        self.ensure_enabled()?;
        self.backend
            .project_by_name(name)
            .await?
            .ok_or_else(|| CoreError::not_found("project", name))
    }

    /// All projects, ordered by creation time.
    ///
    /// # Errors
    ///
    /// `Disabled` or `Storage`.
    pub async fn list_projects(&self) -> CoreResult<Vec<ProjectDescriptor>> {
        self.ensure_enabled()?;
        self.backend.list_projects().await
    }

    /// Fetches a branch by name within a project.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Disabled`, or `Storage`.
    pub async fn get_branch(
        &self,
        project_id: ProjectId,
        name: &str,
    ) -> CoreResult<BranchDescriptor> {
        self.ensure_enabled()?;
        self.backend
            .branch_by_name(project_id, name)
            .await?
            .ok_or_else(|| CoreError::not_found("branch", name))
    }

    /// Fetches a branch by id.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Disabled`, or `Storage`.
    pub async fn get_branch_by_id(&self, branch_id: BranchId) -> CoreResult<BranchDescriptor> {
        self.ensure_enabled()?;
        self.backend
            .branch_by_id(branch_id)
            .await?
            .ok_or_else(|| CoreError::not_found("branch", branch_id.to_string()))
    }

    /// All branches of a project, ordered by creation time.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Disabled`, or `Storage`.
    pub async fn list_branches(&self, project_id: ProjectId) -> CoreResult<Vec<BranchDescriptor>> {
        self.ensure_enabled()?;
        self.get_project(project_id).await?;
        self.backend.list_branches(project_id).await
    }

    /// Tombstones and removes a branch. `main` can only go with its
    /// project.
    ///
    /// # Errors
    ///
    /// `Validation` for `main`, `NotFound`, `Disabled`, `Storage`, or
    /// `Cancelled`.
    pub async fn delete_branch(
        &self,
        project_id: ProjectId,
        name: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        self.ensure_enabled()?;
        if name == MAIN_BRANCH {
            return Err(CoreError::validation(
                "the main branch can only be deleted with its project",
            ));
        }
        let branch = self.get_branch(project_id, name).await?;
        let _guard = self.lock_branch(branch.branch_id, cancel).await?;

        let request = AppendRequest::project_op(
            project_id,
            OperationKind::DeleteBranch,
            json!({ "name": name }),
        )
        .on_branch(branch.branch_id);
        self.wal.append(request, cancel).await?;
        self.backend.remove_branch(branch.branch_id).await?;

        info!(branch = name, "deleted branch");
        Ok(())
    }

    /// Tombstones and removes a project with all of its branches.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Disabled`, `Storage`, or `Cancelled`.
    pub async fn delete_project(
        &self,
        project_id: ProjectId,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        self.ensure_enabled()?;
        let project = self.get_project(project_id).await?;

        // Take every branch lock in ascending id order to stay
        // deadlock-free against concurrent single-branch operations.
        let mut branch_ids: Vec<BranchId> = self
            .backend
            .list_branches(project_id)
            .await?
            .into_iter()
            .map(|b| b.branch_id)
            .collect();
        branch_ids.sort();
        let mut guards = Vec::with_capacity(branch_ids.len());
        for branch_id in branch_ids {
            guards.push(self.lock_branch(branch_id, cancel).await?);
        }

        let request = AppendRequest::project_op(
            project_id,
            OperationKind::DeleteProject,
            json!({ "name": project.name }),
        );
        self.wal.append(request, cancel).await?;
        self.backend.remove_project_branches(project_id).await?;
        self.backend.remove_project(project_id).await?;

        info!(project = %project.name, "deleted project");
        Ok(())
    }

    /// Rebuilds identity rows into an empty backend by folding the WAL's
    /// lifecycle entries, then re-deriving each branch head from the
    /// highest entry tagged to it.
    ///
    /// # Errors
    ///
    /// `Disabled`, `Storage`, or `Cancelled`.
    pub async fn rebuild_from_wal(&self, cancel: &CancellationToken) -> CoreResult<()> {
        self.ensure_enabled()?;
        let end = self.wal.current_lsn();
        if end.is_zero() {
            return Ok(());
        }
        let entries = self.wal.get_range(Lsn::new(1), end, cancel).await?;

        let mut projects: HashMap<ProjectId, ProjectDescriptor> = HashMap::new();
        let mut branches: HashMap<BranchId, BranchDescriptor> = HashMap::new();
        let mut heads: HashMap<BranchId, Lsn> = HashMap::new();

        for entry in &entries {
            match entry.operation {
                OperationKind::CreateProject => {
                    if let Some((project, main)) = decode_project_entry(entry) {
                        branches.insert(main.branch_id, main);
                        projects.insert(project.project_id, project);
                    } else {
                        warn!(lsn = entry.lsn.value(), "skipping malformed create_project entry");
                    }
                }
                OperationKind::CreateBranch => {
                    if let Some(branch) = decode_branch_entry(entry) {
                        branches.insert(branch.branch_id, branch);
                    } else {
                        warn!(lsn = entry.lsn.value(), "skipping malformed create_branch entry");
                    }
                }
                OperationKind::DeleteBranch => {
                    if let Some(branch_id) = entry.branch_id {
                        branches.remove(&branch_id);
                        heads.remove(&branch_id);
                    }
                }
                OperationKind::DeleteProject => {
                    projects.remove(&entry.project_id);
                    branches.retain(|_, b| b.project_id != entry.project_id);
                }
                op if op.advances_head() => {
                    if let Some(branch_id) = entry.branch_id {
                        heads.insert(branch_id, entry.lsn);
                    }
                }
                _ => {}
            }
        }

        let mut restored_projects = 0usize;
        let mut restored_branches = 0usize;
        for project in projects.values() {
            self.backend.insert_project(project).await?;
            restored_projects += 1;
        }
        for branch in branches.values_mut() {
            if let Some(head) = heads.get(&branch.branch_id) {
                branch.head_lsn = (*head).max(branch.base_lsn);
            }
            self.backend.insert_branch(branch).await?;
            restored_branches += 1;
        }

        info!(
            projects = restored_projects,
            branches = restored_branches,
            "rebuilt registry from wal"
        );
        Ok(())
    }

    fn ensure_enabled(&self) -> CoreResult<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(CoreError::Disabled)
        }
    }

    async fn lock_branch(
        &self,
        branch_id: BranchId,
        cancel: &CancellationToken,
    ) -> CoreResult<OwnedMutexGuard<()>> {
        let handle = self.locks.handle(branch_id);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CoreError::Cancelled),
            guard = handle.lock_owned() => Ok(guard),
        }
    }
}

fn decode_project_entry(
    entry: &WalEntry,
) -> Option<(ProjectDescriptor, BranchDescriptor)> {
    let Payload::Value(value) = &entry.payload else {
        return None;
    };
    let name = value.get("name")?.as_str()?.to_string();
    let main_branch_id: BranchId = value.get("main_branch_id")?.as_str()?.parse().ok()?;

    let project = ProjectDescriptor {
        project_id: entry.project_id,
        name,
        main_branch_id,
        created_at: entry.timestamp,
    };
    let main = BranchDescriptor {
        branch_id: main_branch_id,
        project_id: entry.project_id,
        name: MAIN_BRANCH.to_string(),
        base_lsn: entry.lsn,
        head_lsn: entry.lsn,
        fork_lsn: None,
        parent_branch_id: None,
        created_at: entry.timestamp,
    };
    Some((project, main))
}

fn decode_branch_entry(entry: &WalEntry) -> Option<BranchDescriptor> {
    let Payload::Value(value) = &entry.payload else {
        return None;
    };
    let name = value.get("name")?.as_str()?.to_string();
    let parent_branch_id: BranchId = entry.metadata.get(META_PARENT_BRANCH)?.parse().ok()?;
    let fork_lsn: u64 = entry.metadata.get(META_FORK_LSN)?.parse().ok()?;

    Some(BranchDescriptor {
        branch_id: entry.branch_id?,
        project_id: entry.project_id,
        name,
        base_lsn: entry.lsn,
        head_lsn: entry.lsn,
        fork_lsn: Some(Lsn::new(fork_lsn)),
        parent_branch_id: Some(parent_branch_id),
        created_at: entry.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tributary_core::WalConfig;
    use tributary_wal::MemoryWalBackend;

    use crate::memory::MemoryRegistryBackend;

    async fn registry() -> (Arc<Registry>, Arc<WalStore>) {
        let wal = WalStore::open(
            Arc::new(MemoryWalBackend::new()),
            WalConfig {
                page_size: 4,
                page_count: 4,
                flush_interval: Duration::from_millis(5),
            },
            true,
        )
        .await
        .unwrap();
        let registry = Arc::new(Registry::new(
            Arc::new(MemoryRegistryBackend::new()),
            wal.clone(),
            true,
        ));
        (registry, wal)
    }

    #[tokio::test]
    async fn create_project_seeds_main_branch() {
        let (registry, _wal) = registry().await;
        let cancel = CancellationToken::new();

        let project = registry.create_project("p1", &cancel).await.unwrap();
        let main = registry
            .get_branch(project.project_id, MAIN_BRANCH)
            .await
            .unwrap();

        assert_eq!(main.branch_id, project.main_branch_id);
        assert_eq!(main.base_lsn, Lsn::new(1));
        assert_eq!(main.head_lsn, Lsn::new(1));
        assert!(main.fork_lsn.is_none());
    }

    #[tokio::test]
    async fn duplicate_project_names_are_rejected() {
        let (registry, _wal) = registry().await;
        let cancel = CancellationToken::new();

        registry.create_project("p1", &cancel).await.unwrap();
        let err = registry.create_project("p1", &cancel).await.unwrap_err();
        assert_eq!(err.code(), "already_exists");
    }

    #[tokio::test]
    async fn branches_fork_at_parent_head() {
        let (registry, _wal) = registry().await;
        let cancel = CancellationToken::new();

        let project = registry.create_project("p1", &cancel).await.unwrap();
        let branch = registry
            .create_branch(project.project_id, "feature", None, &cancel)
            .await
            .unwrap();

        // The create_branch entry takes LSN 2; the fork point is main's
        // head at creation (LSN 1).
        assert_eq!(branch.base_lsn, Lsn::new(2));
        assert_eq!(branch.head_lsn, Lsn::new(2));
        assert_eq!(branch.fork_lsn, Some(Lsn::new(1)));
        assert_eq!(branch.parent_branch_id, Some(project.main_branch_id));
    }

    #[tokio::test]
    async fn reserved_branch_names_are_rejected() {
        let (registry, _wal) = registry().await;
        let cancel = CancellationToken::new();
        let project = registry.create_project("p1", &cancel).await.unwrap();

        for name in ["main", "master", "HEAD"] {
            let err = registry
                .create_branch(project.project_id, name, None, &cancel)
                .await
                .unwrap_err();
            assert_eq!(err.code(), "validation", "{name}");
        }
    }

    #[tokio::test]
    async fn head_updates_enforce_bounds() {
        let (registry, _wal) = registry().await;
        let cancel = CancellationToken::new();
        let project = registry.create_project("p1", &cancel).await.unwrap();
        let main = registry
            .get_branch(project.project_id, MAIN_BRANCH)
            .await
            .unwrap();

        // Below base.
        let err = registry
            .update_head(main.branch_id, Lsn::ZERO, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "out_of_range");

        // Beyond the log end.
        let err = registry
            .update_head(main.branch_id, Lsn::new(99), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "out_of_range");
    }

    #[tokio::test]
    async fn main_cannot_be_deleted_directly() {
        let (registry, _wal) = registry().await;
        let cancel = CancellationToken::new();
        let project = registry.create_project("p1", &cancel).await.unwrap();

        let err = registry
            .delete_branch(project.project_id, MAIN_BRANCH, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");

        registry
            .delete_project(project.project_id, &cancel)
            .await
            .unwrap();
        assert!(registry.get_project(project.project_id).await.is_err());
    }

    #[tokio::test]
    async fn rebuild_restores_identity_and_heads() {
        let (registry, wal) = registry().await;
        let cancel = CancellationToken::new();

        let project = registry.create_project("p1", &cancel).await.unwrap();
        let branch = registry
            .create_branch(project.project_id, "feature", None, &cancel)
            .await
            .unwrap();
        // Simulate interceptor traffic on the branch.
        let ack = wal
            .append(
                AppendRequest::insert(
                    project.project_id,
                    branch.branch_id,
                    "users",
                    tributary_core::DocumentId::from_string("a"),
                    tributary_core::Document::new(),
                ),
                &cancel,
            )
            .await
            .unwrap();
        registry
            .update_head(branch.branch_id, ack.lsn, &cancel)
            .await
            .unwrap();

        // Rebuild into a fresh backend over the same WAL.
        let rebuilt = Registry::new(Arc::new(MemoryRegistryBackend::new()), wal, true);
        rebuilt.rebuild_from_wal(&cancel).await.unwrap();

        let restored_project = rebuilt.get_project_by_name("p1").await.unwrap();
        assert_eq!(restored_project.project_id, project.project_id);

        let restored_main = rebuilt
            .get_branch(project.project_id, MAIN_BRANCH)
            .await
            .unwrap();
        assert_eq!(restored_main.head_lsn, Lsn::new(1));

        let restored_branch = rebuilt
            .get_branch(project.project_id, "feature")
            .await
            .unwrap();
        assert_eq!(restored_branch.branch_id, branch.branch_id);
        assert_eq!(restored_branch.base_lsn, branch.base_lsn);
        assert_eq!(restored_branch.head_lsn, ack.lsn);
        assert_eq!(restored_branch.fork_lsn, branch.fork_lsn);
    }
}
