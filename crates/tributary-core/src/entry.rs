//! WAL entry types.
//!
//! A `WalEntry` is the immutable record of one operation, stamped with an
//! LSN and a UTC timestamp at append time. Callers submit `AppendRequest`s;
//! the WAL store assigns the LSN/timestamp pair and returns an `AppendAck`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Document, DocumentDelta, DocumentId};
use crate::error::{CoreError, CoreResult};
use crate::ids::{BranchId, ProjectId};
use crate::lsn::Lsn;

/// Metadata key on `create_branch` entries naming the parent branch.
pub const META_PARENT_BRANCH: &str = "parent_branch_id";
/// Metadata key on `create_branch` entries recording the inherited cutoff.
pub const META_FORK_LSN: &str = "fork_lsn";

/// Every operation the log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateProject,
    DeleteProject,
    CreateBranch,
    DeleteBranch,
    Insert,
    Update,
    Delete,
    CreateCollection,
    DropCollection,
}

impl OperationKind {
    /// Stable snake_case name, used in metric labels and storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateProject => "create_project",
            Self::DeleteProject => "delete_project",
            Self::CreateBranch => "create_branch",
            Self::DeleteBranch => "delete_branch",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::CreateCollection => "create_collection",
            Self::DropCollection => "drop_collection",
        }
    }

    /// True for per-document operations (`insert`/`update`/`delete`).
    #[must_use]
    pub fn is_document_op(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }

    /// True for operations that target a named collection.
    #[must_use]
    pub fn targets_collection(&self) -> bool {
        self.is_document_op() || matches!(self, Self::CreateCollection | Self::DropCollection)
    }

    /// True for operations that advance a branch head when applied.
    #[must_use]
    pub fn advances_head(&self) -> bool {
        self.targets_collection()
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry payload, tagged by form so every entry self-describes.
///
/// `insert` carries `Document`; `update` carries either `Delta` or
/// `PostImage`; `delete` carries `Empty`; metadata operations carry `Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "form", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// No payload (`delete` and tombstone entries).
    Empty,
    /// Full document image written by `insert`.
    Document(Document),
    /// Full replacement image written by `replace`-style updates.
    PostImage(Document),
    /// Field-level `{set, unset}` update.
    Delta(DocumentDelta),
    /// Free-form structured value for project/branch/collection metadata.
    Value(Value),
}

impl Payload {
    /// True for the `Empty` form.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// One immutable record in the write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Globally monotonic, gap-free sequence number.
    pub lsn: Lsn,
    /// Wall-clock UTC time, set by the WAL store at append.
    pub timestamp: DateTime<Utc>,
    /// Owning project.
    pub project_id: ProjectId,
    /// Branch the writer was acting on; `None` for project-level entries.
    pub branch_id: Option<BranchId>,
    /// What happened.
    pub operation: OperationKind,
    /// Target collection for collection-scoped operations.
    pub collection: Option<String>,
    /// Logical document key for per-document operations.
    pub document_id: Option<DocumentId>,
    /// Operation payload.
    pub payload: Payload,
    /// Small free-form annotations (e.g. parent branch on `create_branch`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl WalEntry {
    /// The collection name, when the entry targets one.
    #[must_use]
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// True when this entry mutates document state in `collection`.
    #[must_use]
    pub fn touches_collection(&self, collection: &str) -> bool {
        self.operation.targets_collection() && self.collection.as_deref() == Some(collection)
    }
}

/// Acknowledgement returned by a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendAck {
    /// Assigned sequence number.
    pub lsn: Lsn,
    /// Timestamp stamped on the entry.
    pub timestamp: DateTime<Utc>,
}

/// A request to append one entry; the WAL assigns `lsn` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub project_id: ProjectId,
    pub branch_id: Option<BranchId>,
    pub operation: OperationKind,
    pub collection: Option<String>,
    pub document_id: Option<DocumentId>,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl AppendRequest {
    /// Request for an `insert` entry carrying the full document image.
    #[must_use]
    pub fn insert(
        project_id: ProjectId,
        branch_id: BranchId,
        collection: impl Into<String>,
        document_id: DocumentId,
        document: Document,
    ) -> Self {
        Self {
            project_id,
            branch_id: Some(branch_id),
            operation: OperationKind::Insert,
            collection: Some(collection.into()),
            document_id: Some(document_id),
            payload: Payload::Document(document),
            metadata: BTreeMap::new(),
        }
    }

    /// Request for an `update` entry carrying a field-level delta.
    #[must_use]
    pub fn update(
        project_id: ProjectId,
        branch_id: BranchId,
        collection: impl Into<String>,
        document_id: DocumentId,
        delta: DocumentDelta,
    ) -> Self {
        Self {
            project_id,
            branch_id: Some(branch_id),
            operation: OperationKind::Update,
            collection: Some(collection.into()),
            document_id: Some(document_id),
            payload: Payload::Delta(delta),
            metadata: BTreeMap::new(),
        }
    }

    /// Request for an `update` entry carrying a full post-image.
    #[must_use]
    pub fn replace(
        project_id: ProjectId,
        branch_id: BranchId,
        collection: impl Into<String>,
        document_id: DocumentId,
        document: Document,
    ) -> Self {
        Self {
            project_id,
            branch_id: Some(branch_id),
            operation: OperationKind::Update,
            collection: Some(collection.into()),
            document_id: Some(document_id),
            payload: Payload::PostImage(document),
            metadata: BTreeMap::new(),
        }
    }

    /// Request for a `delete` entry.
    #[must_use]
    pub fn delete(
        project_id: ProjectId,
        branch_id: BranchId,
        collection: impl Into<String>,
        document_id: DocumentId,
    ) -> Self {
        Self {
            project_id,
            branch_id: Some(branch_id),
            operation: OperationKind::Delete,
            collection: Some(collection.into()),
            document_id: Some(document_id),
            payload: Payload::Empty,
            metadata: BTreeMap::new(),
        }
    }

    /// Request for a collection metadata entry.
    #[must_use]
    pub fn collection_op(
        project_id: ProjectId,
        branch_id: BranchId,
        operation: OperationKind,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            project_id,
            branch_id: Some(branch_id),
            operation,
            collection: Some(collection.into()),
            document_id: None,
            payload: Payload::Empty,
            metadata: BTreeMap::new(),
        }
    }

    /// Request for a project-level metadata entry.
    #[must_use]
    pub fn project_op(project_id: ProjectId, operation: OperationKind, payload: Value) -> Self {
        Self {
            project_id,
            branch_id: None,
            operation,
            collection: None,
            document_id: None,
            payload: Payload::Value(payload),
            metadata: BTreeMap::new(),
        }
    }

    /// Attaches a metadata annotation.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the branch tag (used by `create_branch`/`delete_branch` which
    /// tag the entry with the branch they describe).
    #[must_use]
    pub fn on_branch(mut self, branch_id: BranchId) -> Self {
        self.branch_id = Some(branch_id);
        self
    }

    /// Checks the per-operation required-field table.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the first missing or malformed field.
    pub fn validate(&self) -> CoreResult<()> {
        use OperationKind as Op;

        if self.operation.targets_collection() {
            match self.collection.as_deref() {
                None | Some("") => {
                    return Err(CoreError::validation(format!(
                        "{} requires a collection name",
                        self.operation
                    )))
                }
                Some(_) => {}
            }
            if self.branch_id.is_none() {
                return Err(CoreError::validation(format!(
                    "{} requires a branch",
                    self.operation
                )));
            }
        }

        if self.operation.is_document_op() && self.document_id.is_none() {
            return Err(CoreError::validation(format!(
                "{} requires a document id",
                self.operation
            )));
        }

        match (self.operation, &self.payload) {
            (Op::Insert, Payload::Document(_)) => Ok(()),
            (Op::Insert, _) => Err(CoreError::validation(
                "insert requires a full document payload",
            )),
            (Op::Update, Payload::Delta(delta)) => {
                if delta.is_empty() {
                    Err(CoreError::validation("update delta must not be empty"))
                } else {
                    Ok(())
                }
            }
            (Op::Update, Payload::PostImage(_)) => Ok(()),
            (Op::Update, _) => Err(CoreError::validation(
                "update requires a delta or post-image payload",
            )),
            (Op::Delete, Payload::Empty) => Ok(()),
            (Op::Delete, _) => Err(CoreError::validation("delete must carry no payload")),
            (Op::CreateProject | Op::CreateBranch, Payload::Value(_)) => Ok(()),
            (Op::CreateProject | Op::CreateBranch, _) => Err(CoreError::validation(format!(
                "{} requires a metadata payload",
                self.operation
            ))),
            (
                Op::DeleteProject | Op::DeleteBranch | Op::CreateCollection | Op::DropCollection,
                Payload::Empty | Payload::Value(_),
            ) => Ok(()),
            (op, _) => Err(CoreError::validation(format!(
                "{op} does not accept this payload form"
            ))),
        }
    }

    /// Materializes the request into an entry once the WAL has assigned an
    /// LSN and timestamp.
    #[must_use]
    pub fn into_entry(self, lsn: Lsn, timestamp: DateTime<Utc>) -> WalEntry {
        WalEntry {
            lsn,
            timestamp,
            project_id: self.project_id,
            branch_id: self.branch_id,
            operation: self.operation,
            collection: self.collection,
            document_id: self.document_id,
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}
