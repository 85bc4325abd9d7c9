//! Core Backend Traits
//!
//! The narrow transactional interface the runner consumes. Backends own the
//! connection; the runner never touches a driver directly.

use async_trait::async_trait;

use crate::error::MigrateResult;
use crate::migrations::definitions::AppliedMigration;

/// Database the migrations run against
#[async_trait]
pub trait MigrationBackend: Send + Sync {
    /// Short description for logs (driver and redacted target)
    fn describe(&self) -> String;

    /// Begin a transaction for one migration step
    async fn begin_transaction(&self) -> MigrateResult<Box<dyn BackendTransaction>>;

    /// Try to take the single-writer lock; `false` if another session holds it
    async fn try_lock(&self, key: i64) -> MigrateResult<bool>;

    /// Release the single-writer lock
    async fn release_lock(&self, key: i64) -> MigrateResult<()>;

    /// Create the bookkeeping table if it does not exist
    async fn ensure_state_table(&self, table: &str) -> MigrateResult<()>;

    /// Whether the bookkeeping table exists; never creates it
    async fn state_table_exists(&self, table: &str) -> MigrateResult<bool>;

    /// Read every bookkeeping row, oldest first
    async fn load_applied(&self, table: &str) -> MigrateResult<Vec<AppliedMigration>>;
}

/// One open transaction; dropped transactions must roll back
#[async_trait]
pub trait BackendTransaction: Send {
    /// Execute one statement of a migration step
    async fn execute(&mut self, statement: &str) -> MigrateResult<()>;

    /// Insert a bookkeeping row; returns rows inserted (0 if the id is already recorded)
    async fn insert_applied(&mut self, table: &str, record: &AppliedMigration) -> MigrateResult<u64>;

    /// Delete a bookkeeping row; returns rows deleted
    async fn delete_applied(&mut self, table: &str, id: &str) -> MigrateResult<u64>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> MigrateResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> MigrateResult<()>;
}

/// Lock key for a bookkeeping table (64-bit FNV-1a of the table name).
///
/// Runners sharing a bookkeeping table contend for the same key.
pub fn lock_key(table: &str) -> i64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    let hash = table
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME));
    i64::from_ne_bytes(hash.to_ne_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_is_stable_per_table() {
        assert_eq!(lock_key("shale_migrations"), lock_key("shale_migrations"));
        assert_ne!(lock_key("shale_migrations"), lock_key("other_migrations"));
    }
}
