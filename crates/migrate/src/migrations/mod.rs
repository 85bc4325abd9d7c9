//! Migration System
//!
//! Records and plans, the loader, dependency resolution, bookkeeping and
//! the runner.

pub mod definitions;
pub mod graph;
pub mod manager;
pub mod rollback;
pub mod runner;
pub mod state;

pub use definitions::{
    AppliedMigration, MigrationDirection, MigrationRecord, MigrationRunResult, MigrationState,
    MigrationStatus, Plan,
};
pub use graph::{ancestors, descendants, topological_order, DependencyGraph};
pub use manager::{split_sql_statements, MigrationManager};
pub use runner::{CancellationFlag, MigrationRunner, PlanObserver, RunnerOptions};
pub use state::{check_consistency, StateStore};
