//! Error types for the migration runner
//!
//! Load-time errors (`Cycle`, `UnknownDependency`, `DuplicateMigration`,
//! `Source`) mean no plan can be computed. Target errors are fatal for one
//! invocation only. Run-time errors carry a [`Progress`] describing what was
//! committed before the run halted.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::migrations::definitions::MigrationDirection;

/// Result alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// How far a halted run got
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// Migrations whose transactions committed, in execution order
    pub completed: Vec<String>,
    /// Migrations of the plan that were never started
    pub not_attempted: Vec<String>,
}

impl Progress {
    pub fn new(completed: Vec<String>, not_attempted: Vec<String>) -> Self {
        Self {
            completed,
            not_attempted,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |ids: &[String]| {
            if ids.is_empty() {
                "none".to_string()
            } else {
                ids.join(", ")
            }
        };
        write!(
            f,
            "completed: [{}]; not attempted: [{}]",
            list(&self.completed),
            list(&self.not_attempted)
        )
    }
}

/// Error types for migration operations
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("Migration '{migration}' depends on unknown migration '{dependency}'")]
    UnknownDependency {
        migration: String,
        dependency: String,
    },

    #[error("Migration id '{id}' is defined more than once")]
    DuplicateMigration { id: String },

    #[error("'{revision}' matches multiple revisions. Please specify one of {}", candidates.join(", "))]
    AmbiguousTarget {
        revision: String,
        candidates: Vec<String>,
    },

    #[error("'{revision}' doesn't match any revisions")]
    NoSuchTarget { revision: String },

    #[error("Failed to {direction} migration '{migration}': {message} ({progress})")]
    StepExecution {
        migration: String,
        direction: MigrationDirection,
        message: String,
        progress: Progress,
    },

    #[error("State inconsistency for migration '{migration}': {message} ({progress})")]
    StateInconsistency {
        migration: String,
        message: String,
        progress: Progress,
    },

    #[error("Run cancelled before migration '{next}' ({progress})")]
    Cancelled { next: String, progress: Progress },

    #[error("Migration lock unavailable: {message}")]
    LockUnavailable { message: String },

    #[error("Invalid migration source {}: {message}", path.display())]
    Source { path: PathBuf, message: String },

    #[error("Backend error: {message}")]
    Backend { message: String },
}

impl MigrateError {
    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create a migration source error
    pub fn source_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Source {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a state inconsistency error without progress information
    pub fn inconsistency(migration: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StateInconsistency {
            migration: migration.into(),
            message: message.into(),
            progress: Progress::default(),
        }
    }

    /// Create a step execution error without progress information
    pub fn step(
        migration: impl Into<String>,
        direction: MigrationDirection,
        message: impl Into<String>,
    ) -> Self {
        Self::StepExecution {
            migration: migration.into(),
            direction,
            message: message.into(),
            progress: Progress::default(),
        }
    }

    /// Attach run progress to a run-time error; other variants are unchanged
    pub fn with_progress(self, new_progress: Progress) -> Self {
        match self {
            Self::StepExecution {
                migration,
                direction,
                message,
                ..
            } => Self::StepExecution {
                migration,
                direction,
                message,
                progress: new_progress,
            },
            Self::StateInconsistency {
                migration, message, ..
            } => Self::StateInconsistency {
                migration,
                message,
                progress: new_progress,
            },
            Self::Cancelled { next, .. } => Self::Cancelled {
                next,
                progress: new_progress,
            },
            other => other,
        }
    }

    /// Progress of the halted run, for run-time errors
    pub fn progress(&self) -> Option<&Progress> {
        match self {
            Self::StepExecution { progress, .. }
            | Self::StateInconsistency { progress, .. }
            | Self::Cancelled { progress, .. } => Some(progress),
            _ => None,
        }
    }

    /// The migration the error is about, when there is one
    pub fn migration_id(&self) -> Option<&str> {
        match self {
            Self::UnknownDependency { migration, .. }
            | Self::StepExecution { migration, .. }
            | Self::StateInconsistency { migration, .. } => Some(migration),
            Self::DuplicateMigration { id } => Some(id),
            Self::Cancelled { next, .. } => Some(next),
            _ => None,
        }
    }

    /// Errors raised before any plan could be computed
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::Cycle { .. }
                | Self::UnknownDependency { .. }
                | Self::DuplicateMigration { .. }
                | Self::Source { .. }
        )
    }
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        MigrateError::Backend {
            message: err.to_string(),
        }
    }
}
