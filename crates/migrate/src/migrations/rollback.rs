//! Migration Rollback - Handles rolling back applied migrations
//!
//! Rollbacks run dependents first. `rollback_to` undoes the target and every
//! applied migration that transitively depends on it; applied migrations
//! unrelated to the target are left alone.

use super::definitions::{MigrationRecord, MigrationRunResult, Plan};
use super::graph::DependencyGraph;
use super::runner::MigrationRunner;
use crate::error::MigrateResult;

impl MigrationRunner {
    /// Roll back every applied migration in reverse dependency order
    pub async fn rollback_all(&self, records: &[MigrationRecord]) -> MigrateResult<MigrationRunResult> {
        let graph = DependencyGraph::build(records.to_vec())?;
        self.run(&graph, |graph, applied| Ok(graph.plan_rollback_all(applied)))
            .await
    }

    /// Roll back `revision` and everything applied that depends on it.
    ///
    /// The revision is matched against ids using the runner's target match
    /// mode; no match or several matches fail before the lock is taken.
    pub async fn rollback_to(&self, revision: &str, records: &[MigrationRecord]) -> MigrateResult<MigrationRunResult> {
        let graph = DependencyGraph::build(records.to_vec())?;
        let target = graph
            .resolve_target(revision, self.options().target_match)?
            .id()
            .to_string();
        tracing::debug!("Resolved rollback target '{}' to {}", revision, target);

        self.run(&graph, |graph, applied| graph.plan_rollback_to(&target, applied))
            .await
    }

    /// Plan for `rollback_all`, without taking the lock or executing
    pub async fn plan_rollback_all(&self, records: &[MigrationRecord]) -> MigrateResult<Plan> {
        let graph = DependencyGraph::build(records.to_vec())?;
        let applied = self.current_applied().await?;
        Ok(graph.plan_rollback_all(&applied))
    }

    /// Plan for `rollback_to`, without taking the lock or executing
    pub async fn plan_rollback_to(&self, revision: &str, records: &[MigrationRecord]) -> MigrateResult<Plan> {
        let graph = DependencyGraph::build(records.to_vec())?;
        let target = graph
            .resolve_target(revision, self.options().target_match)?
            .id()
            .to_string();
        let applied = self.current_applied().await?;
        graph.plan_rollback_to(&target, &applied)
    }
}
