//! Core domain types for the Tributary branching engine: LSNs, typed ids,
//! schemaless documents, WAL entries, project/branch descriptors, the error
//! taxonomy, configuration, and metric definitions.

pub mod branch;
pub mod config;
pub mod document;
pub mod entry;
pub mod error;
pub mod ids;
pub mod lsn;
pub mod metrics;
pub mod project;

pub use branch::{validate_branch_name, BranchDescriptor, MAIN_BRANCH, RESERVED_BRANCH_NAMES};
pub use config::{EngineConfig, SnapshotCacheConfig, WalConfig};
pub use document::{Document, DocumentDelta, DocumentId, ID_FIELD};
pub use entry::{
    AppendAck, AppendRequest, OperationKind, Payload, WalEntry, META_FORK_LSN, META_PARENT_BRANCH,
};
pub use error::{CoreError, CoreResult};
pub use ids::{BranchId, ProjectId};
pub use lsn::Lsn;
pub use project::{validate_project_name, ProjectDescriptor, MAX_PROJECT_NAME_LEN};
