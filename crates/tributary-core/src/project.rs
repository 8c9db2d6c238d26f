use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::{BranchId, ProjectId};

/// Longest accepted project name.
pub const MAX_PROJECT_NAME_LEN: usize = 128;

/// Identity row for a tenant namespace. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    /// Globally unique identifier.
    pub project_id: ProjectId,
    /// Unique human-readable name.
    pub name: String,
    /// The auto-created `main` branch.
    pub main_branch_id: BranchId,
    /// Creation time (the timestamp of the `create_project` entry).
    pub created_at: DateTime<Utc>,
}

/// Validates a project name.
///
/// # Errors
///
/// Returns `Validation` for empty, oversized, or `$`-prefixed names.
pub fn validate_project_name(name: &str) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::validation("project name must not be empty"));
    }
    if name.len() > MAX_PROJECT_NAME_LEN {
        return Err(CoreError::validation(format!(
            "project name exceeds {MAX_PROJECT_NAME_LEN} characters"
        )));
    }
    if name.starts_with('$') {
        return Err(CoreError::validation("project name must not start with `$`"));
    }
    Ok(())
}
