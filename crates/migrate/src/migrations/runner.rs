//! Migration Runner - Executes migrations against the database
//!
//! Every run holds the backend's single-writer lock for its whole plan,
//! checks the ledger against the loaded graph, then executes the plan one
//! migration per transaction. The first failure halts the run; migrations
//! committed before it stay committed.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Instrument;

use shale_core::{MigrateConfig, TargetMatch, DEFAULT_STATE_TABLE};

use super::definitions::{
    MigrationDirection, MigrationRecord, MigrationRunResult, MigrationState, MigrationStatus, Plan,
};
use super::graph::DependencyGraph;
use super::state::{check_consistency, StateStore};
use crate::backends::core::{lock_key, MigrationBackend};
use crate::backends::postgres::PostgresBackend;
use crate::error::{MigrateError, MigrateResult, Progress};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Operator interrupt, honored between migration transactions only
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Callback receiving the computed plan before it executes
pub type PlanObserver = Arc<dyn Fn(&Plan) + Send + Sync>;

/// Runner settings
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Bookkeeping table name
    pub state_table: String,
    /// How `rollback_to`/`apply_to` revisions are matched against ids
    pub target_match: TargetMatch,
    /// How long to wait for the single-writer lock; `None` fails immediately
    pub lock_timeout: Option<Duration>,
    /// Compute and report the plan without executing it
    pub dry_run: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            state_table: DEFAULT_STATE_TABLE.to_string(),
            target_match: TargetMatch::Exact,
            lock_timeout: None,
            dry_run: false,
        }
    }
}

impl RunnerOptions {
    pub fn from_config(config: &MigrateConfig) -> Self {
        Self {
            state_table: config.state_table.clone(),
            target_match: config.target_match,
            lock_timeout: config.lock_timeout(),
            dry_run: false,
        }
    }
}

/// Migration runner that executes migrations against a backend
pub struct MigrationRunner {
    backend: Arc<dyn MigrationBackend>,
    state: StateStore,
    options: RunnerOptions,
    cancellation: CancellationFlag,
    observer: Option<PlanObserver>,
}

impl MigrationRunner {
    /// Create a runner with default options
    pub fn new(backend: Arc<dyn MigrationBackend>) -> Self {
        Self::with_options(backend, RunnerOptions::default())
    }

    pub fn with_options(backend: Arc<dyn MigrationBackend>, options: RunnerOptions) -> Self {
        let state = StateStore::new(Arc::clone(&backend), options.state_table.clone());
        Self {
            backend,
            state,
            options,
            cancellation: CancellationFlag::new(),
            observer: None,
        }
    }

    /// Connect to the configured PostgreSQL database
    pub async fn from_config(config: &MigrateConfig) -> MigrateResult<Self> {
        let database_url = config
            .require_database_url()
            .map_err(|e| MigrateError::backend(e.to_string()))?;
        let backend = PostgresBackend::connect(database_url, config.statement_timeout()).await?;

        Ok(Self::with_options(Arc::new(backend), RunnerOptions::from_config(config)))
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = flag;
        self
    }

    pub fn with_plan_observer(mut self, observer: PlanObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.options.dry_run = dry_run;
        self
    }

    pub fn backend(&self) -> &Arc<dyn MigrationBackend> {
        &self.backend
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }

    /// Apply every migration not yet applied, in dependency order
    pub async fn apply_pending(&self, records: &[MigrationRecord]) -> MigrateResult<MigrationRunResult> {
        let graph = DependencyGraph::build(records.to_vec())?;
        self.run(&graph, |graph, applied| Ok(graph.plan_apply(applied)))
            .await
    }

    /// Apply `revision` and whatever it depends on that is not yet applied
    pub async fn apply_to(&self, revision: &str, records: &[MigrationRecord]) -> MigrateResult<MigrationRunResult> {
        let graph = DependencyGraph::build(records.to_vec())?;
        let target = graph
            .resolve_target(revision, self.options.target_match)?
            .id()
            .to_string();
        self.run(&graph, |graph, applied| graph.plan_apply_to(&target, applied))
            .await
    }

    /// Plan for `apply_pending`, without taking the lock or executing
    pub async fn plan_apply(&self, records: &[MigrationRecord]) -> MigrateResult<Plan> {
        let graph = DependencyGraph::build(records.to_vec())?;
        let applied = self.current_applied().await?;
        Ok(graph.plan_apply(&applied))
    }

    /// Plan for `apply_to`, without taking the lock or executing
    pub async fn plan_apply_to(&self, revision: &str, records: &[MigrationRecord]) -> MigrateResult<Plan> {
        let graph = DependencyGraph::build(records.to_vec())?;
        let target = graph.resolve_target(revision, self.options.target_match)?.id().to_string();
        let applied = self.current_applied().await?;
        graph.plan_apply_to(&target, &applied)
    }

    /// Status of every migration, in apply order
    pub async fn status(&self, records: &[MigrationRecord]) -> MigrateResult<Vec<(MigrationRecord, MigrationStatus)>> {
        let graph = DependencyGraph::build(records.to_vec())?;
        let applied_at = self.state.applied_at().await?;

        Ok(graph
            .topological_order()
            .into_iter()
            .map(|record| {
                let status = match applied_at.get(record.id()) {
                    Some(applied_at) => MigrationStatus::Applied {
                        applied_at: *applied_at,
                    },
                    None => MigrationStatus::Pending,
                };
                (record.clone(), status)
            })
            .collect())
    }

    /// Applied ids for planning; does not create the bookkeeping table
    pub(crate) async fn current_applied(&self) -> MigrateResult<BTreeSet<String>> {
        Ok(self
            .state
            .peek_records()
            .await?
            .into_iter()
            .map(|record| record.id)
            .collect())
    }

    /// Run a plan under the single-writer lock
    pub(crate) async fn run<F>(&self, graph: &DependencyGraph, planner: F) -> MigrateResult<MigrationRunResult>
    where
        F: FnOnce(&DependencyGraph, &BTreeSet<String>) -> MigrateResult<Plan> + Send,
    {
        let key = lock_key(self.state.table());
        self.acquire_lock(key).await?;

        let span = tracing::info_span!(
            "migration_run",
            backend = %self.backend.describe(),
            table = %self.state.table(),
        );
        let result = self.run_locked(graph, planner).instrument(span).await;

        if let Err(e) = self.backend.release_lock(key).await {
            tracing::warn!("Failed to release migration lock: {}", e);
        }
        result
    }

    async fn acquire_lock(&self, key: i64) -> MigrateResult<()> {
        let deadline = Instant::now() + self.options.lock_timeout.unwrap_or_default();

        loop {
            if self.backend.try_lock(key).await? {
                tracing::debug!("Acquired migration lock {}", key);
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(MigrateError::LockUnavailable {
                    message: format!(
                        "another migration run holds the lock for table '{}'",
                        self.state.table()
                    ),
                });
            }

            tracing::debug!("Migration lock busy, waiting");
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn run_locked<F>(&self, graph: &DependencyGraph, planner: F) -> MigrateResult<MigrationRunResult>
    where
        F: FnOnce(&DependencyGraph, &BTreeSet<String>) -> MigrateResult<Plan> + Send,
    {
        let start_time = Instant::now();

        self.state.ensure().await?;
        let applied = self.state.all_applied().await?;
        check_consistency(&applied, graph)?;

        let plan = planner(graph, &applied)?;
        tracing::info!(
            "Planned {} of {} migration(s), {} already in place",
            plan.direction(),
            plan.len(),
            plan.skipped()
        );
        if let Some(observer) = &self.observer {
            observer(&plan);
        }

        let completed = if self.options.dry_run {
            tracing::info!("Dry run: no migrations executed");
            Vec::new()
        } else {
            self.execute_plan(&plan).await?
        };

        Ok(MigrationRunResult {
            direction: plan.direction(),
            plan: plan.ids(),
            completed,
            skipped_count: plan.skipped(),
            dry_run: self.options.dry_run,
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }

    /// Execute each step in order, stopping at the first failure
    async fn execute_plan(&self, plan: &Plan) -> MigrateResult<Vec<String>> {
        let direction = plan.direction();
        let ids = plan.ids();
        let mut completed = Vec::with_capacity(ids.len());

        for (index, migration) in plan.steps().iter().enumerate() {
            if self.cancellation.is_cancelled() {
                tracing::warn!("Run cancelled before {}", migration.id());
                return Err(MigrateError::Cancelled {
                    next: migration.id().to_string(),
                    progress: Progress::new(completed, ids[index..].to_vec()),
                });
            }

            if let Err(e) = self.execute_step(migration, direction).await {
                tracing::error!("Migration {}: {}", MigrationState::Failed, e);
                return Err(e.with_progress(Progress::new(completed, ids[index + 1..].to_vec())));
            }
            completed.push(migration.id().to_string());
        }

        Ok(completed)
    }

    /// One migration in one transaction: statements, bookkeeping, commit
    async fn execute_step(&self, migration: &MigrationRecord, direction: MigrationDirection) -> MigrateResult<()> {
        let id = migration.id();
        tracing::info!("{} {}: {}", MigrationState::in_flight(direction), id, migration);

        let mut tx = self
            .backend
            .begin_transaction()
            .await
            .map_err(|e| MigrateError::step(id, direction, format!("failed to start transaction: {}", e)))?;

        for statement in migration.steps(direction) {
            tracing::debug!("{}: {}", id, statement);
            if let Err(e) = tx.execute(statement).await {
                if let Err(rollback_error) = tx.rollback().await {
                    tracing::warn!("Failed to roll back transaction for {}: {}", id, rollback_error);
                }
                return Err(MigrateError::step(id, direction, e.to_string()));
            }
        }

        let recorded = match direction {
            MigrationDirection::Up => self.state.mark_applied(tx.as_mut(), id).await,
            MigrationDirection::Down => self.state.mark_unapplied(tx.as_mut(), id).await,
        };
        if let Err(e) = recorded {
            if let Err(rollback_error) = tx.rollback().await {
                tracing::warn!("Failed to roll back transaction for {}: {}", id, rollback_error);
            }
            return Err(e);
        }

        if let Err(commit_error) = tx.commit().await {
            return Err(self.reconcile_commit_failure(id, direction, commit_error).await);
        }

        tracing::info!("{} {}", MigrationState::settled(direction), id);
        Ok(())
    }

    /// Decide what a failed commit actually left behind
    async fn reconcile_commit_failure(
        &self,
        id: &str,
        direction: MigrationDirection,
        commit_error: MigrateError,
    ) -> MigrateError {
        let expected_after_commit = direction == MigrationDirection::Up;

        match self.state.is_applied(id).await {
            Ok(applied) if applied == expected_after_commit => MigrateError::inconsistency(
                id,
                format!(
                    "commit reported failure ({}) but the bookkeeping change is durable",
                    commit_error
                ),
            ),
            Ok(_) => MigrateError::step(id, direction, format!("failed to commit: {}", commit_error)),
            Err(check_error) => MigrateError::inconsistency(
                id,
                format!(
                    "commit failed ({}) and the outcome could not be verified: {}",
                    commit_error, check_error
                ),
            ),
        }
    }
}
