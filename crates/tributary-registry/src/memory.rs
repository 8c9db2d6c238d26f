//! In-memory registry backend for tests and embedded use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tributary_core::{
    BranchDescriptor, BranchId, CoreError, CoreResult, Lsn, ProjectDescriptor, ProjectId,
};

use crate::backend::RegistryBackend;

#[derive(Default)]
struct Tables {
    projects: HashMap<ProjectId, ProjectDescriptor>,
    branches: HashMap<BranchId, BranchDescriptor>,
}

/// Hash-map registry backend with the same uniqueness rules as the MongoDB
/// implementation.
#[derive(Clone, Default)]
pub struct MemoryRegistryBackend {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryRegistryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryBackend for MemoryRegistryBackend {
    async fn insert_project(&self, project: &ProjectDescriptor) -> CoreResult<()> {
        let mut tables = self.tables.write();
        if tables.projects.values().any(|p| p.name == project.name) {
            return Err(CoreError::already_exists("project", &project.name));
        }
        tables.projects.insert(project.project_id, project.clone());
        Ok(())
    }

    async fn project_by_id(&self, project_id: ProjectId) -> CoreResult<Option<ProjectDescriptor>> {
        Ok(self.tables.read().projects.get(&project_id).cloned())
    }

    async fn project_by_name(&self, name: &str) -> CoreResult<Option<ProjectDescriptor>> {
        Ok(self
            .tables
            .read()
            .projects
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn list_projects(&self) -> CoreResult<Vec<ProjectDescriptor>> {
        let mut projects: Vec<_> = self.tables.read().projects.values().cloned().collect();
        projects.sort_by_key(|p| p.created_at);
        Ok(projects)
    }

    async fn remove_project(&self, project_id: ProjectId) -> CoreResult<()> {
        self.tables.write().projects.remove(&project_id);
        Ok(())
    }

    async fn insert_branch(&self, branch: &BranchDescriptor) -> CoreResult<()> {
        let mut tables = self.tables.write();
        if tables
            .branches
            .values()
            .any(|b| b.project_id == branch.project_id && b.name == branch.name)
        {
            return Err(CoreError::already_exists("branch", &branch.name));
        }
        tables.branches.insert(branch.branch_id, branch.clone());
        Ok(())
    }

    async fn branch_by_id(&self, branch_id: BranchId) -> CoreResult<Option<BranchDescriptor>> {
        Ok(self.tables.read().branches.get(&branch_id).cloned())
    }

    async fn branch_by_name(
        &self,
        project_id: ProjectId,
        name: &str,
    ) -> CoreResult<Option<BranchDescriptor>> {
        Ok(self
            .tables
            .read()
            .branches
            .values()
            .find(|b| b.project_id == project_id && b.name == name)
            .cloned())
    }

    async fn list_branches(&self, project_id: ProjectId) -> CoreResult<Vec<BranchDescriptor>> {
        let mut branches: Vec<_> = self
            .tables
            .read()
            .branches
            .values()
            .filter(|b| b.project_id == project_id)
            .cloned()
            .collect();
        branches.sort_by_key(|b| b.created_at);
        Ok(branches)
    }

    async fn update_branch_head(&self, branch_id: BranchId, head_lsn: Lsn) -> CoreResult<()> {
        let mut tables = self.tables.write();
        match tables.branches.get_mut(&branch_id) {
            Some(branch) => {
                branch.head_lsn = head_lsn;
                Ok(())
            }
            None => Err(CoreError::not_found("branch", branch_id.to_string())),
        }
    }

    async fn remove_branch(&self, branch_id: BranchId) -> CoreResult<()> {
        self.tables.write().branches.remove(&branch_id);
        Ok(())
    }

    async fn remove_project_branches(&self, project_id: ProjectId) -> CoreResult<()> {
        self.tables
            .write()
            .branches
            .retain(|_, b| b.project_id != project_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn project(name: &str) -> ProjectDescriptor {
        ProjectDescriptor {
            project_id: ProjectId::new(),
            name: name.to_string(),
            main_branch_id: BranchId::new(),
            created_at: Utc::now(),
        }
    }

    fn branch(project_id: ProjectId, name: &str) -> BranchDescriptor {
        BranchDescriptor {
            branch_id: BranchId::new(),
            project_id,
            name: name.to_string(),
            base_lsn: Lsn::new(1),
            head_lsn: Lsn::new(1),
            fork_lsn: None,
            parent_branch_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn project_names_are_unique() {
        let backend = MemoryRegistryBackend::new();
        backend.insert_project(&project("p1")).await.unwrap();
        let err = backend.insert_project(&project("p1")).await.unwrap_err();
        assert_eq!(err.code(), "already_exists");
    }

    #[tokio::test]
    async fn branch_names_are_unique_per_project() {
        let backend = MemoryRegistryBackend::new();
        let p1 = ProjectId::new();
        let p2 = ProjectId::new();

        backend.insert_branch(&branch(p1, "feature")).await.unwrap();
        assert!(backend.insert_branch(&branch(p1, "feature")).await.is_err());
        // Same name in another project is fine.
        backend.insert_branch(&branch(p2, "feature")).await.unwrap();
    }

    #[tokio::test]
    async fn head_update_hits_one_row() {
        let backend = MemoryRegistryBackend::new();
        let row = branch(ProjectId::new(), "feature");
        backend.insert_branch(&row).await.unwrap();

        backend
            .update_branch_head(row.branch_id, Lsn::new(9))
            .await
            .unwrap();
        let loaded = backend.branch_by_id(row.branch_id).await.unwrap().unwrap();
        assert_eq!(loaded.head_lsn, Lsn::new(9));

        let missing = backend.update_branch_head(BranchId::new(), Lsn::new(1)).await;
        assert!(matches!(missing, Err(CoreError::NotFound { .. })));
    }
}
