use thiserror::Error;

/// Canonical error type for all core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity was not found in the registry or log.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type name (e.g. `"branch"`).
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// Entity already exists and cannot be created again.
    #[error("{entity} `{id}` already exists")]
    AlreadyExists {
        /// Entity type name (e.g. `"project"`).
        entity: &'static str,
        /// Identifier that conflicts.
        id: String,
    },

    /// Caller supplied invalid input (names, missing fields, reserved words).
    #[error("validation error: {message}")]
    Validation {
        /// Human-readable description of the rejected input.
        message: String,
    },

    /// LSN or timestamp outside the legal bounds for a branch.
    #[error("out of range: {message}")]
    OutOfRange {
        /// Human-readable description of the violated bound.
        message: String,
    },

    /// The write-ahead log is disabled; the core is inert.
    #[error("write-ahead log is disabled")]
    Disabled,

    /// Transient or persistent backing-store failure.
    #[error("storage error: {message}")]
    Storage {
        /// Backend-provided failure details.
        message: String,
    },

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `AlreadyExists` variant.
    #[must_use]
    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    /// Creates a `Validation` variant.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an `OutOfRange` variant.
    #[must_use]
    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::OutOfRange {
            message: message.into(),
        }
    }

    /// Creates a `Storage` variant.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Stable machine-readable code, used as a metric label.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Validation { .. } => "validation",
            Self::OutOfRange { .. } => "out_of_range",
            Self::Disabled => "disabled",
            Self::Storage { .. } => "storage",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage {
            message: format!("payload serialization: {err}"),
        }
    }
}

/// Convenient result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
