//! PostgreSQL Backend Implementation
//!
//! Uses sqlx. The single-writer lock is a session-level advisory lock held on
//! a dedicated pooled connection for the duration of a run.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, Row, Transaction};
use shale_core::config::redact_url;
use tokio::sync::Mutex;

use super::core::{BackendTransaction, MigrationBackend};
use crate::error::{MigrateError, MigrateResult};
use crate::migrations::definitions::AppliedMigration;

/// PostgreSQL migration backend
pub struct PostgresBackend {
    pool: PgPool,
    lock_connection: Mutex<Option<PoolConnection<Postgres>>>,
    target: String,
}

impl PostgresBackend {
    /// Connect to the database named by `database_url`.
    ///
    /// `statement_timeout` is applied to every session; a statement that
    /// exceeds it fails its migration step.
    pub async fn connect(database_url: &str, statement_timeout: Option<Duration>) -> MigrateResult<Self> {
        let mut options = PgConnectOptions::from_str(database_url)
            .map_err(|e| MigrateError::backend(format!("Invalid database URL: {}", e)))?;

        if let Some(timeout) = statement_timeout {
            options = options.options([("statement_timeout", format!("{}ms", timeout.as_millis()))]);
        }

        let target = redact_url(database_url);

        // One connection for the advisory lock, one for migration transactions
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::backend(format!("Failed to connect to database: {}", e)))?;

        Ok(Self {
            pool,
            lock_connection: Mutex::new(None),
            target,
        })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lock_connection: Mutex::new(None),
            target: "postgres".to_string(),
        }
    }

    /// Get the database pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MigrationBackend for PostgresBackend {
    fn describe(&self) -> String {
        self.target.clone()
    }

    async fn begin_transaction(&self) -> MigrateResult<Box<dyn BackendTransaction>> {
        let inner = self
            .pool
            .begin()
            .await
            .map_err(|e| MigrateError::backend(format!("Failed to start transaction: {}", e)))?;

        Ok(Box::new(PostgresTransaction { inner }))
    }

    async fn try_lock(&self, key: i64) -> MigrateResult<bool> {
        let mut held = self.lock_connection.lock().await;
        if held.is_some() {
            return Ok(true);
        }

        let mut connection = self
            .pool
            .acquire()
            .await
            .map_err(|e| MigrateError::backend(format!("Failed to acquire lock connection: {}", e)))?;

        let row = sqlx::query("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *connection)
            .await
            .map_err(|e| MigrateError::backend(format!("Failed to request advisory lock: {}", e)))?;
        let acquired: bool = row.try_get(0)?;

        if acquired {
            *held = Some(connection);
        }
        Ok(acquired)
    }

    async fn release_lock(&self, key: i64) -> MigrateResult<()> {
        let mut held = self.lock_connection.lock().await;
        if let Some(mut connection) = held.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(key)
                .execute(&mut *connection)
                .await
                .map_err(|e| MigrateError::backend(format!("Failed to release advisory lock: {}", e)))?;
        }
        Ok(())
    }

    async fn ensure_state_table(&self, table: &str) -> MigrateResult<()> {
        sqlx::query(&create_state_table_sql(table))
            .execute(&self.pool)
            .await
            .map_err(|e| MigrateError::backend(format!("Failed to create migrations table: {}", e)))?;
        Ok(())
    }

    async fn state_table_exists(&self, table: &str) -> MigrateResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MigrateError::backend(format!("Failed to look up migrations table: {}", e)))?;
        Ok(exists)
    }

    async fn load_applied(&self, table: &str) -> MigrateResult<Vec<AppliedMigration>> {
        let sql = format!(
            "SELECT id, applied_at FROM {} ORDER BY applied_at ASC, id ASC",
            table
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrateError::backend(format!("Failed to query applied migrations: {}", e)))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let applied_at: DateTime<Utc> = row.try_get("applied_at")?;
            records.push(AppliedMigration { id, applied_at });
        }

        Ok(records)
    }
}

/// Open PostgreSQL transaction; sqlx rolls it back if dropped uncommitted
pub struct PostgresTransaction {
    inner: Transaction<'static, Postgres>,
}

#[async_trait]
impl BackendTransaction for PostgresTransaction {
    async fn execute(&mut self, statement: &str) -> MigrateResult<()> {
        sqlx::query(statement).execute(&mut *self.inner).await?;
        Ok(())
    }

    async fn insert_applied(&mut self, table: &str, record: &AppliedMigration) -> MigrateResult<u64> {
        let sql = format!(
            "INSERT INTO {} (id, applied_at) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
            table
        );
        let result = sqlx::query(&sql)
            .bind(&record.id)
            .bind(record.applied_at)
            .execute(&mut *self.inner)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_applied(&mut self, table: &str, id: &str) -> MigrateResult<u64> {
        let sql = format!("DELETE FROM {} WHERE id = $1", table);
        let result = sqlx::query(&sql).bind(id).execute(&mut *self.inner).await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> MigrateResult<()> {
        self.inner
            .commit()
            .await
            .map_err(|e| MigrateError::backend(format!("Failed to commit: {}", e)))
    }

    async fn rollback(self: Box<Self>) -> MigrateResult<()> {
        self.inner
            .rollback()
            .await
            .map_err(|e| MigrateError::backend(format!("Failed to roll back: {}", e)))
    }
}

/// SQL to create the migrations tracking table
pub fn create_state_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
            id VARCHAR(255) PRIMARY KEY,\n    \
            applied_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP\n\
        )",
        table
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_table_sql() {
        let sql = create_state_table_sql("shale_migrations");
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS shale_migrations"));
        assert!(sql.contains("id VARCHAR(255) PRIMARY KEY"));
        assert!(sql.contains("applied_at TIMESTAMPTZ NOT NULL"));
    }
}
