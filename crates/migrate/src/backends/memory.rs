//! In-memory backend
//!
//! Models just enough of a database to exercise the runner: a schema of
//! tables and columns driven by CREATE/DROP TABLE and ALTER TABLE ADD/DROP
//! COLUMN, bookkeeping tables, an exclusive lock and injectable faults.
//! A transaction works on a copy of the database taken at `begin` and swaps it
//! in on `commit`, so a rolled-back or dropped transaction leaves no trace.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::core::{BackendTransaction, MigrationBackend};
use crate::error::{MigrateError, MigrateResult};
use crate::migrations::definitions::AppliedMigration;

/// Tables and their columns, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySchema {
    tables: BTreeMap<String, Vec<String>>,
}

impl MemorySchema {
    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn columns(&self, table: &str) -> Option<&[String]> {
        self.tables.get(table).map(Vec::as_slice)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Apply one DDL statement; unrecognised statements are accepted as no-ops
    fn apply(&mut self, statement: &str) -> Result<(), String> {
        let tokens = tokenize(statement);
        let upper: Vec<String> = tokens.iter().map(|t| t.to_uppercase()).collect();
        let keyword = |index: usize| upper.get(index).map(String::as_str).unwrap_or("");

        match (keyword(0), keyword(1)) {
            ("CREATE", "TABLE") => {
                let (if_not_exists, at) = if keyword(2) == "IF" && keyword(3) == "NOT" {
                    (true, 5)
                } else {
                    (false, 2)
                };
                let name = identifier(&tokens, at)?;
                if self.tables.contains_key(&name) {
                    return if if_not_exists {
                        Ok(())
                    } else {
                        Err(format!("relation \"{}\" already exists", name))
                    };
                }
                let columns = column_definitions(&tokens[at + 1..], &upper[at + 1..]);
                self.tables.insert(name, columns);
                Ok(())
            }
            ("DROP", "TABLE") => {
                let (if_exists, at) = if keyword(2) == "IF" {
                    (true, 4)
                } else {
                    (false, 2)
                };
                let name = identifier(&tokens, at)?;
                if self.tables.remove(&name).is_none() && !if_exists {
                    return Err(format!("table \"{}\" does not exist", name));
                }
                Ok(())
            }
            ("ALTER", "TABLE") => {
                let name = identifier(&tokens, 2)?;
                let columns = self
                    .tables
                    .get_mut(&name)
                    .ok_or_else(|| format!("relation \"{}\" does not exist", name))?;

                let mut at = 4;
                if keyword(at) == "COLUMN" {
                    at += 1;
                }
                match keyword(3) {
                    "ADD" => {
                        let column = identifier(&tokens, at)?;
                        if columns.contains(&column) {
                            return Err(format!(
                                "column \"{}\" of relation \"{}\" already exists",
                                column, name
                            ));
                        }
                        columns.push(column);
                        Ok(())
                    }
                    "DROP" => {
                        let if_exists = keyword(at) == "IF";
                        if if_exists {
                            at += 2;
                        }
                        let column = identifier(&tokens, at)?;
                        match columns.iter().position(|c| *c == column) {
                            Some(index) => {
                                columns.remove(index);
                                Ok(())
                            }
                            None if if_exists => Ok(()),
                            None => Err(format!(
                                "column \"{}\" of relation \"{}\" does not exist",
                                column, name
                            )),
                        }
                    }
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

/// Split SQL into words, keeping parentheses and commas as their own tokens
fn tokenize(statement: &str) -> Vec<String> {
    let spaced = statement
        .replace('(', " ( ")
        .replace(')', " ) ")
        .replace(',', " , ")
        .replace(';', " ");
    spaced.split_whitespace().map(str::to_string).collect()
}

/// Unquoted identifiers fold to lower case, quoted ones are kept verbatim
fn identifier(tokens: &[String], index: usize) -> Result<String, String> {
    let token = tokens
        .get(index)
        .ok_or_else(|| "syntax error: missing identifier".to_string())?;
    if token == "(" || token == ")" || token == "," {
        return Err(format!("syntax error at or near \"{}\"", token));
    }
    Ok(if token.starts_with('"') && token.ends_with('"') && token.len() > 1 {
        token[1..token.len() - 1].to_string()
    } else {
        token.to_lowercase()
    })
}

/// Column names from a `( col type, ..., PRIMARY KEY (..) )` list
fn column_definitions(tokens: &[String], upper: &[String]) -> Vec<String> {
    const CONSTRAINTS: [&str; 5] = ["PRIMARY", "UNIQUE", "CONSTRAINT", "FOREIGN", "CHECK"];

    let mut columns = Vec::new();
    let mut depth = 0usize;
    let mut element_start = false;

    for (index, token) in tokens.iter().enumerate() {
        match token.as_str() {
            "(" => {
                depth += 1;
                if depth == 1 {
                    element_start = true;
                }
            }
            ")" => depth = depth.saturating_sub(1),
            "," if depth == 1 => element_start = true,
            _ if depth == 1 && element_start => {
                element_start = false;
                if !CONSTRAINTS.contains(&upper[index].as_str()) {
                    if let Ok(name) = identifier(tokens, index) {
                        columns.push(name);
                    }
                }
            }
            _ => {}
        }
    }

    columns
}

#[derive(Debug, Clone, Default)]
struct DatabaseState {
    schema: MemorySchema,
    ledgers: BTreeMap<String, BTreeMap<String, DateTime<Utc>>>,
}

#[derive(Debug, Default)]
struct Faults {
    statements: Vec<String>,
    state_writes: HashSet<String>,
    commits: BTreeMap<String, bool>,
}

#[derive(Debug, Default)]
struct MemoryDatabase {
    state: DatabaseState,
    locks: HashSet<i64>,
    executed: Vec<String>,
    faults: Faults,
}

/// In-process backend for tests and demonstrations
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryDatabase>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn db(&self) -> MigrateResult<MutexGuard<'_, MemoryDatabase>> {
        lock_database(&self.inner)
    }

    /// Snapshot of the committed schema
    pub fn schema(&self) -> MigrateResult<MemorySchema> {
        Ok(self.db()?.state.schema.clone())
    }

    /// Committed bookkeeping ids of a table, sorted
    pub fn ledger(&self, table: &str) -> MigrateResult<Vec<String>> {
        Ok(self
            .db()?
            .state
            .ledgers
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Every statement passed to `execute`, including failed ones
    pub fn executed_statements(&self) -> MigrateResult<Vec<String>> {
        Ok(self.db()?.executed.clone())
    }

    pub fn clear_executed(&self) -> MigrateResult<()> {
        self.db()?.executed.clear();
        Ok(())
    }

    /// Fail any statement containing `fragment`
    pub fn fail_statement(&self, fragment: impl Into<String>) -> MigrateResult<()> {
        self.db()?.faults.statements.push(fragment.into());
        Ok(())
    }

    /// Fail bookkeeping writes for migration `id`
    pub fn fail_state_write(&self, id: impl Into<String>) -> MigrateResult<()> {
        self.db()?.faults.state_writes.insert(id.into());
        Ok(())
    }

    /// Fail the commit of a transaction that records or removes `id`.
    ///
    /// With `persist` the changes are kept even though an error is returned,
    /// modelling a connection lost after the server committed.
    pub fn fail_commit(&self, id: impl Into<String>, persist: bool) -> MigrateResult<()> {
        self.db()?.faults.commits.insert(id.into(), persist);
        Ok(())
    }

    pub fn clear_faults(&self) -> MigrateResult<()> {
        self.db()?.faults = Faults::default();
        Ok(())
    }

    /// Write a bookkeeping row outside any migration (simulates drift)
    pub fn insert_ledger_row(&self, table: &str, id: impl Into<String>) -> MigrateResult<()> {
        self.db()?
            .state
            .ledgers
            .entry(table.to_string())
            .or_default()
            .insert(id.into(), Utc::now());
        Ok(())
    }

    /// Take the lock as if another session held it
    pub fn hold_lock(&self, key: i64) -> MigrateResult<()> {
        self.db()?.locks.insert(key);
        Ok(())
    }

    pub fn is_locked(&self, key: i64) -> MigrateResult<bool> {
        Ok(self.db()?.locks.contains(&key))
    }
}

fn lock_database(inner: &Mutex<MemoryDatabase>) -> MigrateResult<MutexGuard<'_, MemoryDatabase>> {
    inner
        .lock()
        .map_err(|_| MigrateError::backend("in-memory database lock poisoned"))
}

#[async_trait]
impl MigrationBackend for MemoryBackend {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn begin_transaction(&self) -> MigrateResult<Box<dyn BackendTransaction>> {
        let working = self.db()?.state.clone();
        Ok(Box::new(MemoryTransaction {
            database: Arc::clone(&self.inner),
            working,
            touched: BTreeSet::new(),
        }))
    }

    async fn try_lock(&self, key: i64) -> MigrateResult<bool> {
        Ok(self.db()?.locks.insert(key))
    }

    async fn release_lock(&self, key: i64) -> MigrateResult<()> {
        self.db()?.locks.remove(&key);
        Ok(())
    }

    async fn ensure_state_table(&self, table: &str) -> MigrateResult<()> {
        self.db()?
            .state
            .ledgers
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    async fn state_table_exists(&self, table: &str) -> MigrateResult<bool> {
        Ok(self.db()?.state.ledgers.contains_key(table))
    }

    async fn load_applied(&self, table: &str) -> MigrateResult<Vec<AppliedMigration>> {
        let db = self.db()?;
        let rows = db
            .state
            .ledgers
            .get(table)
            .ok_or_else(|| MigrateError::backend(format!("relation \"{}\" does not exist", table)))?;

        let mut records: Vec<AppliedMigration> = rows
            .iter()
            .map(|(id, applied_at)| AppliedMigration {
                id: id.clone(),
                applied_at: *applied_at,
            })
            .collect();
        records.sort_by(|a, b| a.applied_at.cmp(&b.applied_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }
}

/// Transaction over a private copy of the in-memory database
pub struct MemoryTransaction {
    database: Arc<Mutex<MemoryDatabase>>,
    working: DatabaseState,
    touched: BTreeSet<String>,
}

impl MemoryTransaction {
    fn ledger_mut(&mut self, table: &str) -> MigrateResult<&mut BTreeMap<String, DateTime<Utc>>> {
        self.working
            .ledgers
            .get_mut(table)
            .ok_or_else(|| MigrateError::backend(format!("relation \"{}\" does not exist", table)))
    }

    fn check_state_fault(&self, id: &str) -> MigrateResult<()> {
        let db = lock_database(&self.database)?;
        if db.faults.state_writes.contains(id) {
            return Err(MigrateError::backend(format!(
                "injected failure writing bookkeeping row for '{}'",
                id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendTransaction for MemoryTransaction {
    async fn execute(&mut self, statement: &str) -> MigrateResult<()> {
        {
            let mut db = lock_database(&self.database)?;
            db.executed.push(statement.to_string());
            if let Some(fragment) = db
                .faults
                .statements
                .iter()
                .find(|fragment| statement.contains(fragment.as_str()))
            {
                return Err(MigrateError::backend(format!(
                    "injected failure for statement matching '{}'",
                    fragment
                )));
            }
        }

        self.working
            .schema
            .apply(statement)
            .map_err(MigrateError::backend)
    }

    async fn insert_applied(&mut self, table: &str, record: &AppliedMigration) -> MigrateResult<u64> {
        self.check_state_fault(&record.id)?;
        self.touched.insert(record.id.clone());

        let ledger = self.ledger_mut(table)?;
        if ledger.contains_key(&record.id) {
            return Ok(0);
        }
        ledger.insert(record.id.clone(), record.applied_at);
        Ok(1)
    }

    async fn delete_applied(&mut self, table: &str, id: &str) -> MigrateResult<u64> {
        self.check_state_fault(id)?;
        self.touched.insert(id.to_string());

        let ledger = self.ledger_mut(table)?;
        Ok(u64::from(ledger.remove(id).is_some()))
    }

    async fn commit(self: Box<Self>) -> MigrateResult<()> {
        let MemoryTransaction {
            database,
            working,
            touched,
        } = *self;
        let mut db = lock_database(&database)?;

        let fault = touched
            .iter()
            .find_map(|id| db.faults.commits.get(id).map(|persist| (id.clone(), *persist)));

        match fault {
            Some((id, persist)) => {
                if persist {
                    db.state = working;
                }
                Err(MigrateError::backend(format!(
                    "injected commit failure for '{}'",
                    id
                )))
            }
            None => {
                db.state = working;
                Ok(())
            }
        }
    }

    async fn rollback(self: Box<Self>) -> MigrateResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_ddl() {
        let mut schema = MemorySchema::default();
        schema
            .apply("CREATE TABLE users (id INT, name VARCHAR(20), PRIMARY KEY (id))")
            .unwrap();
        assert_eq!(schema.columns("users").unwrap(), ["id", "name"]);

        schema.apply("ALTER TABLE users ADD COLUMN age INT;").unwrap();
        assert_eq!(schema.columns("users").unwrap(), ["id", "name", "age"]);

        assert!(schema.apply("ALTER TABLE users ADD COLUMN age INT").is_err());
        assert!(schema.apply("CREATE TABLE users (id INT)").is_err());
        assert!(schema.apply("CREATE TABLE IF NOT EXISTS users (id INT)").is_ok());

        schema.apply("ALTER TABLE users DROP COLUMN age").unwrap();
        assert_eq!(schema.columns("users").unwrap(), ["id", "name"]);
        assert!(schema.apply("ALTER TABLE users DROP COLUMN age").is_err());
        assert!(schema.apply("ALTER TABLE users DROP COLUMN IF EXISTS age").is_ok());

        schema.apply("DROP TABLE users").unwrap();
        assert!(schema.is_empty());
        assert!(schema.apply("DROP TABLE users").is_err());
        assert!(schema.apply("ALTER TABLE users ADD COLUMN age INT").is_err());
    }

    #[test]
    fn test_non_ddl_statements_are_accepted() {
        let mut schema = MemorySchema::default();
        assert!(schema.apply("INSERT INTO users (id) VALUES (1)").is_ok());
        assert!(schema.is_empty());
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_leaves_no_trace() {
        let backend = MemoryBackend::new();
        backend.ensure_state_table("ledger").await.unwrap();

        let mut tx = backend.begin_transaction().await.unwrap();
        tx.execute("CREATE TABLE users (id INT)").await.unwrap();
        tx.insert_applied("ledger", &AppliedMigration::now("create-users"))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(!backend.schema().unwrap().has_table("users"));
        assert!(backend.ledger("ledger").unwrap().is_empty());
        assert_eq!(backend.executed_statements().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_publishes_schema_and_ledger_together() {
        let backend = MemoryBackend::new();
        backend.ensure_state_table("ledger").await.unwrap();

        let mut tx = backend.begin_transaction().await.unwrap();
        tx.execute("CREATE TABLE users (id INT)").await.unwrap();
        assert_eq!(
            tx.insert_applied("ledger", &AppliedMigration::now("create-users"))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            tx.insert_applied("ledger", &AppliedMigration::now("create-users"))
                .await
                .unwrap(),
            0
        );
        tx.commit().await.unwrap();

        assert!(backend.schema().unwrap().has_table("users"));
        assert_eq!(backend.ledger("ledger").unwrap(), vec!["create-users"]);
    }

    #[tokio::test]
    async fn test_commit_fault_with_and_without_persist() {
        let backend = MemoryBackend::new();
        backend.ensure_state_table("ledger").await.unwrap();
        backend.fail_commit("a", false).unwrap();
        backend.fail_commit("b", true).unwrap();

        let mut tx = backend.begin_transaction().await.unwrap();
        tx.insert_applied("ledger", &AppliedMigration::now("a")).await.unwrap();
        assert!(tx.commit().await.is_err());
        assert!(backend.ledger("ledger").unwrap().is_empty());

        let mut tx = backend.begin_transaction().await.unwrap();
        tx.insert_applied("ledger", &AppliedMigration::now("b")).await.unwrap();
        assert!(tx.commit().await.is_err());
        assert_eq!(backend.ledger("ledger").unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let backend = MemoryBackend::new();
        assert!(backend.try_lock(7).await.unwrap());
        assert!(!backend.try_lock(7).await.unwrap());
        backend.release_lock(7).await.unwrap();
        assert!(backend.try_lock(7).await.unwrap());
    }
}
