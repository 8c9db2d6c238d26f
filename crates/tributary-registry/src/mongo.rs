//! MongoDB-backed registry persistence.
//!
//! Identity rows live in the `projects` collection (unique index on
//! `name`) and the `branches` collection (unique index on
//! `(project_id, name)`), alongside the WAL in the system's dedicated
//! logical database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::info;
use tributary_core::{
    BranchDescriptor, BranchId, CoreError, CoreResult, Lsn, ProjectDescriptor, ProjectId,
};

use crate::backend::RegistryBackend;

/// Collection holding project rows.
pub const PROJECTS_COLLECTION: &str = "projects";
/// Collection holding branch rows.
pub const BRANCHES_COLLECTION: &str = "branches";

#[derive(Debug, Serialize, Deserialize)]
struct ProjectRecord {
    project_id: String,
    name: String,
    main_branch_id: String,
    created_at: mongodb::bson::DateTime,
}

impl ProjectRecord {
    fn encode(project: &ProjectDescriptor) -> Self {
        Self {
            project_id: project.project_id.to_string(),
            name: project.name.clone(),
            main_branch_id: project.main_branch_id.to_string(),
            created_at: mongodb::bson::DateTime::from_millis(
                project.created_at.timestamp_millis(),
            ),
        }
    }

    fn decode(self) -> CoreResult<ProjectDescriptor> {
        Ok(ProjectDescriptor {
            project_id: parse_id("project_id", &self.project_id)?,
            name: self.name,
            main_branch_id: parse_id("main_branch_id", &self.main_branch_id)?,
            created_at: decode_time(self.created_at)?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BranchRecord {
    branch_id: String,
    project_id: String,
    name: String,
    base_lsn: i64,
    head_lsn: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    fork_lsn: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_branch_id: Option<String>,
    created_at: mongodb::bson::DateTime,
}

impl BranchRecord {
    fn encode(branch: &BranchDescriptor) -> CoreResult<Self> {
        Ok(Self {
            branch_id: branch.branch_id.to_string(),
            project_id: branch.project_id.to_string(),
            name: branch.name.clone(),
            base_lsn: lsn_to_i64(branch.base_lsn)?,
            head_lsn: lsn_to_i64(branch.head_lsn)?,
            fork_lsn: branch.fork_lsn.map(lsn_to_i64).transpose()?,
            parent_branch_id: branch.parent_branch_id.map(|id| id.to_string()),
            created_at: mongodb::bson::DateTime::from_millis(branch.created_at.timestamp_millis()),
        })
    }

    fn decode(self) -> CoreResult<BranchDescriptor> {
        Ok(BranchDescriptor {
            branch_id: parse_id("branch_id", &self.branch_id)?,
            project_id: parse_id("project_id", &self.project_id)?,
            name: self.name,
            base_lsn: Lsn::new(self.base_lsn.max(0).unsigned_abs()),
            head_lsn: Lsn::new(self.head_lsn.max(0).unsigned_abs()),
            fork_lsn: self.fork_lsn.map(|v| Lsn::new(v.max(0).unsigned_abs())),
            parent_branch_id: self
                .parent_branch_id
                .as_deref()
                .map(|raw| parse_id("parent_branch_id", raw))
                .transpose()?,
            created_at: decode_time(self.created_at)?,
        })
    }
}

/// Registry backend over a MongoDB deployment.
pub struct MongoRegistryBackend {
    projects: Collection<ProjectRecord>,
    branches: Collection<BranchRecord>,
}

impl MongoRegistryBackend {
    /// Opens the backend over an existing database handle and creates the
    /// uniqueness indexes.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when index creation fails.
    pub async fn new(database: &Database) -> CoreResult<Self> {
        let backend = Self {
            projects: database.collection(PROJECTS_COLLECTION),
            branches: database.collection(BRANCHES_COLLECTION),
        };
        backend.ensure_indexes().await?;
        Ok(backend)
    }

    /// Connects to `uri` and opens the backend on `db_name`.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on connection or index-creation failure.
    pub async fn connect(uri: &str, db_name: &str) -> CoreResult<Self> {
        let client = Client::with_uri_str(uri).await.map_err(storage_err)?;
        info!(db = db_name, "connected registry backend");
        Self::new(&client.database(db_name)).await
    }

    async fn ensure_indexes(&self) -> CoreResult<()> {
        self.projects
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "name": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await
            .map_err(storage_err)?;
        self.branches
            .create_indexes(vec![
                IndexModel::builder()
                    .keys(doc! { "project_id": 1, "name": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                IndexModel::builder()
                    .keys(doc! { "branch_id": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            ])
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl RegistryBackend for MongoRegistryBackend {
    async fn insert_project(&self, project: &ProjectDescriptor) -> CoreResult<()> {
        self.projects
            .insert_one(ProjectRecord::encode(project))
            .await
            .map(|_| ())
            .map_err(|err| {
                if is_duplicate_key(&err) {
                    CoreError::already_exists("project", &project.name)
                } else {
                    storage_err(err)
                }
            })
    }

    async fn project_by_id(&self, project_id: ProjectId) -> CoreResult<Option<ProjectDescriptor>> {
        self.projects
            .find_one(doc! { "project_id": project_id.to_string() })
            .await
            .map_err(storage_err)?
            .map(ProjectRecord::decode)
            .transpose()
    }

    async fn project_by_name(&self, name: &str) -> CoreResult<Option<ProjectDescriptor>> {
        self.projects
            .find_one(doc! { "name": name })
            .await
            .map_err(storage_err)?
            .map(ProjectRecord::decode)
            .transpose()
    }

    async fn list_projects(&self) -> CoreResult<Vec<ProjectDescriptor>> {
        let mut cursor = self
            .projects
            .find(doc! {})
            .sort(doc! { "created_at": 1 })
            .await
            .map_err(storage_err)?;
        let mut out = Vec::new();
        while let Some(record) = cursor.try_next().await.map_err(storage_err)? {
            out.push(record.decode()?);
        }
        Ok(out)
    }

    async fn remove_project(&self, project_id: ProjectId) -> CoreResult<()> {
        self.projects
            .delete_one(doc! { "project_id": project_id.to_string() })
            .await
            .map(|_| ())
            .map_err(storage_err)
    }

    async fn insert_branch(&self, branch: &BranchDescriptor) -> CoreResult<()> {
        self.branches
            .insert_one(BranchRecord::encode(branch)?)
            .await
            .map(|_| ())
            .map_err(|err| {
                if is_duplicate_key(&err) {
                    CoreError::already_exists("branch", &branch.name)
                } else {
                    storage_err(err)
                }
            })
    }

    async fn branch_by_id(&self, branch_id: BranchId) -> CoreResult<Option<BranchDescriptor>> {
        self.branches
            .find_one(doc! { "branch_id": branch_id.to_string() })
            .await
            .map_err(storage_err)?
            .map(BranchRecord::decode)
            .transpose()
    }

    async fn branch_by_name(
        &self,
        project_id: ProjectId,
        name: &str,
    ) -> CoreResult<Option<BranchDescriptor>> {
        self.branches
            .find_one(doc! { "project_id": project_id.to_string(), "name": name })
            .await
            .map_err(storage_err)?
            .map(BranchRecord::decode)
            .transpose()
    }

    async fn list_branches(&self, project_id: ProjectId) -> CoreResult<Vec<BranchDescriptor>> {
        let mut cursor = self
            .branches
            .find(doc! { "project_id": project_id.to_string() })
            .sort(doc! { "created_at": 1 })
            .await
            .map_err(storage_err)?;
        let mut out = Vec::new();
        while let Some(record) = cursor.try_next().await.map_err(storage_err)? {
            out.push(record.decode()?);
        }
        Ok(out)
    }

    async fn update_branch_head(&self, branch_id: BranchId, head_lsn: Lsn) -> CoreResult<()> {
        let result = self
            .branches
            .update_one(
                doc! { "branch_id": branch_id.to_string() },
                doc! { "$set": { "head_lsn": lsn_to_i64(head_lsn)? } },
            )
            .await
            .map_err(storage_err)?;
        if result.matched_count == 0 {
            return Err(CoreError::not_found("branch", branch_id.to_string()));
        }
        Ok(())
    }

    async fn remove_branch(&self, branch_id: BranchId) -> CoreResult<()> {
        self.branches
            .delete_one(doc! { "branch_id": branch_id.to_string() })
            .await
            .map(|_| ())
            .map_err(storage_err)
    }

    async fn remove_project_branches(&self, project_id: ProjectId) -> CoreResult<()> {
        self.branches
            .delete_many(doc! { "project_id": project_id.to_string() })
            .await
            .map(|_| ())
            .map_err(storage_err)
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_err)) => write_err.code == 11000,
        _ => false,
    }
}

fn lsn_to_i64(lsn: Lsn) -> CoreResult<i64> {
    i64::try_from(lsn.value())
        .map_err(|_| CoreError::storage(format!("{lsn} exceeds the storable i64 range")))
}

fn decode_time(raw: mongodb::bson::DateTime) -> CoreResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(raw.timestamp_millis())
        .ok_or_else(|| CoreError::storage("registry row carries an unrepresentable timestamp"))
}

fn parse_id<T: std::str::FromStr>(field: &str, raw: &str) -> CoreResult<T> {
    raw.parse()
        .map_err(|_| CoreError::storage(format!("malformed {field} `{raw}` in registry")))
}

fn storage_err(err: impl std::fmt::Display) -> CoreError {
    CoreError::storage(err.to_string())
}
