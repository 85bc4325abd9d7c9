//! Applied-state bookkeeping
//!
//! Reads go straight to the backend. Writes happen only inside the
//! transaction of the step they record, so a step and its bookkeeping row
//! commit or roll back together.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::definitions::AppliedMigration;
use super::graph::DependencyGraph;
use crate::backends::core::{BackendTransaction, MigrationBackend};
use crate::error::{MigrateError, MigrateResult};

/// Durable record of which migrations are applied
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn MigrationBackend>,
    table: String,
}

impl StateStore {
    pub fn new(backend: Arc<dyn MigrationBackend>, table: impl Into<String>) -> Self {
        Self {
            backend,
            table: table.into(),
        }
    }

    /// Name of the bookkeeping table
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the bookkeeping table if needed
    pub async fn ensure(&self) -> MigrateResult<()> {
        self.backend.ensure_state_table(&self.table).await
    }

    pub async fn exists(&self) -> MigrateResult<bool> {
        self.backend.state_table_exists(&self.table).await
    }

    /// Bookkeeping rows without creating the table; a missing table reads as empty
    pub async fn peek_records(&self) -> MigrateResult<Vec<AppliedMigration>> {
        if !self.exists().await? {
            return Ok(Vec::new());
        }
        self.applied_records().await
    }

    pub async fn is_applied(&self, id: &str) -> MigrateResult<bool> {
        Ok(self
            .applied_records()
            .await?
            .iter()
            .any(|record| record.id == id))
    }

    /// Ids of every applied migration
    pub async fn all_applied(&self) -> MigrateResult<BTreeSet<String>> {
        Ok(self
            .applied_records()
            .await?
            .into_iter()
            .map(|record| record.id)
            .collect())
    }

    /// Bookkeeping rows, oldest first
    pub async fn applied_records(&self) -> MigrateResult<Vec<AppliedMigration>> {
        self.backend.load_applied(&self.table).await
    }

    /// Applied timestamps keyed by id; a missing table reads as empty
    pub async fn applied_at(&self) -> MigrateResult<BTreeMap<String, DateTime<Utc>>> {
        Ok(self
            .peek_records()
            .await?
            .into_iter()
            .map(|record| (record.id, record.applied_at))
            .collect())
    }

    /// Record `id` as applied inside the step's transaction.
    ///
    /// Anything other than exactly one inserted row means the ledger disagrees
    /// with the plan and is reported as an inconsistency.
    pub async fn mark_applied(&self, tx: &mut dyn BackendTransaction, id: &str) -> MigrateResult<()> {
        let rows = tx
            .insert_applied(&self.table, &AppliedMigration::now(id))
            .await
            .map_err(|e| MigrateError::inconsistency(id, format!("failed to record as applied: {}", e)))?;

        if rows != 1 {
            return Err(MigrateError::inconsistency(
                id,
                format!("expected to record 1 row as applied, recorded {}", rows),
            ));
        }
        Ok(())
    }

    /// Remove `id` from the applied set inside the step's transaction
    pub async fn mark_unapplied(&self, tx: &mut dyn BackendTransaction, id: &str) -> MigrateResult<()> {
        let rows = tx
            .delete_applied(&self.table, id)
            .await
            .map_err(|e| MigrateError::inconsistency(id, format!("failed to remove from applied set: {}", e)))?;

        if rows != 1 {
            return Err(MigrateError::inconsistency(
                id,
                format!("expected to remove 1 applied row, removed {}", rows),
            ));
        }
        Ok(())
    }
}

/// Check that `applied` is a known, order-consistent subset of `graph`.
///
/// Every applied id must be a known migration and every dependency of an
/// applied migration must itself be applied.
pub fn check_consistency(applied: &BTreeSet<String>, graph: &DependencyGraph) -> MigrateResult<()> {
    for id in applied {
        let record = graph.get(id).ok_or_else(|| {
            MigrateError::inconsistency(id.as_str(), "recorded as applied but no such migration is known")
        })?;

        if let Some(missing) = record
            .dependencies()
            .iter()
            .find(|dependency| !applied.contains(*dependency))
        {
            return Err(MigrateError::inconsistency(
                id.as_str(),
                format!("recorded as applied but its dependency '{}' is not", missing),
            ));
        }
    }
    Ok(())
}
