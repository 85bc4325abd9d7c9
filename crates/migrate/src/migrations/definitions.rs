//! Migration Definitions - Core types used throughout the migration system
//!
//! Defines MigrationRecord (the static description of one migration),
//! AppliedMigration (the persisted bookkeeping row), Plan and the result types.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Static description of one migration
///
/// Immutable once built: the loader and the builder methods are the only
/// ways to construct one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    id: String,
    description: Option<String>,
    depends_on: BTreeSet<String>,
    forward: Vec<String>,
    backward: Vec<String>,
    source: Option<PathBuf>,
}

impl MigrationRecord {
    /// Start building a migration with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            depends_on: BTreeSet::new(),
            forward: Vec::new(),
            backward: Vec::new(),
            source: None,
        }
    }

    /// Add a dependency on another migration id
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Add a forward (apply) statement
    pub fn forward(mut self, statement: impl Into<String>) -> Self {
        self.forward.push(statement.into());
        self
    }

    /// Add a backward (rollback) statement
    pub fn backward(mut self, statement: impl Into<String>) -> Self {
        self.backward.push(statement.into());
        self
    }

    /// Set the human-readable description
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub(crate) fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.depends_on
    }

    pub fn forward_steps(&self) -> &[String] {
        &self.forward
    }

    pub fn backward_steps(&self) -> &[String] {
        &self.backward
    }

    /// File the migration was loaded from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Statements to execute for a direction
    pub fn steps(&self, direction: MigrationDirection) -> &[String] {
        match direction {
            MigrationDirection::Up => &self.forward,
            MigrationDirection::Down => &self.backward,
        }
    }
}

impl fmt::Display for MigrationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{} ({})", self.id, description),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Persisted bookkeeping row for an applied migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    /// Migration ID
    pub id: String,
    /// When the migration was applied
    pub applied_at: DateTime<Utc>,
}

impl AppliedMigration {
    /// Record a migration as applied now
    pub fn now(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            applied_at: Utc::now(),
        }
    }
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    /// Apply the migration (run forward statements)
    Up,
    /// Rollback the migration (run backward statements)
    Down,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationDirection::Up => write!(f, "apply"),
            MigrationDirection::Down => write!(f, "roll back"),
        }
    }
}

/// Per-migration state during a run
///
/// Apply: `Unapplied -> Applying -> Applied | Failed`.
/// Rollback: `Applied -> RollingBack -> Unapplied | Failed`.
/// `Failed` is terminal and never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Unapplied,
    Applying,
    Applied,
    RollingBack,
    Failed,
}

impl MigrationState {
    /// State held while a direction's transaction is open
    pub fn in_flight(direction: MigrationDirection) -> Self {
        match direction {
            MigrationDirection::Up => MigrationState::Applying,
            MigrationDirection::Down => MigrationState::RollingBack,
        }
    }

    /// State reached when a direction's transaction commits
    pub fn settled(direction: MigrationDirection) -> Self {
        match direction {
            MigrationDirection::Up => MigrationState::Applied,
            MigrationDirection::Down => MigrationState::Unapplied,
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            MigrationState::Unapplied => "unapplied",
            MigrationState::Applying => "applying",
            MigrationState::Applied => "applied",
            MigrationState::RollingBack => "rolling back",
            MigrationState::Failed => "failed",
        };
        write!(f, "{}", state)
    }
}

/// Migration status in the system
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Migration is pending (not yet applied)
    Pending,
    /// Migration has been applied
    Applied {
        /// When it was applied
        applied_at: DateTime<Utc>,
    },
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        matches!(self, MigrationStatus::Applied { .. })
    }
}

/// Ordered sequence of migrations to execute in one direction
///
/// Computed fresh for every operation and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    direction: MigrationDirection,
    steps: Vec<MigrationRecord>,
    skipped: usize,
}

impl Plan {
    pub fn new(direction: MigrationDirection, steps: Vec<MigrationRecord>, skipped: usize) -> Self {
        Self {
            direction,
            steps,
            skipped,
        }
    }

    pub fn direction(&self) -> MigrationDirection {
        self.direction
    }

    pub fn steps(&self) -> &[MigrationRecord] {
        &self.steps
    }

    /// Migrations in scope that needed no action (already in the target state)
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn ids(&self) -> Vec<String> {
        self.steps.iter().map(|m| m.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "Nothing to {}", self.direction);
        }

        writeln!(f, "Plan to {} {} migration(s):", self.direction, self.steps.len())?;
        for (index, migration) in self.steps.iter().enumerate() {
            write!(f, "  {}. {}", index + 1, migration)?;
            if index + 1 < self.steps.len() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// Result of a completed migration run
#[derive(Debug, Clone)]
pub struct MigrationRunResult {
    /// Direction of the run
    pub direction: MigrationDirection,
    /// IDs in the computed plan, in execution order
    pub plan: Vec<String>,
    /// IDs whose transactions committed
    pub completed: Vec<String>,
    /// Number of migrations in scope that needed no action
    pub skipped_count: usize,
    /// True when the plan was computed but not executed
    pub dry_run: bool,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl MigrationRunResult {
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }
}
