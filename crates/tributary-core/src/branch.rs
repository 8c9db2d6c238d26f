use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::{BranchId, ProjectId};
use crate::lsn::Lsn;

/// Name of the auto-created default branch.
pub const MAIN_BRANCH: &str = "main";

/// Names callers may not claim; `main` is created by the system.
pub const RESERVED_BRANCH_NAMES: [&str; 3] = ["main", "master", "HEAD"];

/// A pointer into the WAL: identity plus `(base_lsn, head_lsn)`.
///
/// `base_lsn` is the LSN of the branch's own `create_branch` (or
/// `create_project`, for `main`) entry. `fork_lsn` is the source-branch LSN
/// whose visible history the branch inherits; `None` for a project's main
/// branch, which has no ancestry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchDescriptor {
    pub branch_id: BranchId,
    pub project_id: ProjectId,
    /// Unique within the project.
    pub name: String,
    /// Smallest LSN owned by the branch; floor for head resets.
    pub base_lsn: Lsn,
    /// Largest applied LSN.
    pub head_lsn: Lsn,
    /// Inherited-history cutoff on the parent, when forked.
    pub fork_lsn: Option<Lsn>,
    /// Parent branch, when forked.
    pub parent_branch_id: Option<BranchId>,
    pub created_at: DateTime<Utc>,
}

impl BranchDescriptor {
    /// True for a project's auto-created default branch.
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.name == MAIN_BRANCH
    }
}

/// Validates a caller-supplied branch name.
///
/// Names match `[A-Za-z0-9_-]`, are 2-64 characters long, and must not be a
/// reserved word (`main`/`master`/`HEAD`).
///
/// # Errors
///
/// Returns `Validation` describing the first violated rule.
pub fn validate_branch_name(name: &str) -> CoreResult<()> {
    if name.len() < 2 || name.len() > 64 {
        return Err(CoreError::validation(
            "branch name must be 2-64 characters long",
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CoreError::validation(
            "branch name may only contain letters, digits, `_` and `-`",
        ));
    }
    if RESERVED_BRANCH_NAMES
        .iter()
        .any(|reserved| name.eq_ignore_ascii_case(reserved))
    {
        return Err(CoreError::validation(format!(
            "branch name `{name}` is reserved"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        for name in ["feature", "fix-42", "release_2024", "ab"] {
            assert!(validate_branch_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_reserved_names() {
        for name in ["main", "master", "HEAD", "Main", "head"] {
            assert!(validate_branch_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(validate_branch_name("a").is_err());
        assert!(validate_branch_name(&"x".repeat(65)).is_err());
        assert!(validate_branch_name("no spaces").is_err());
        assert!(validate_branch_name("naïve").is_err());
    }
}
