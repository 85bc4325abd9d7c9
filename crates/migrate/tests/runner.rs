//! Runner behavior against the in-memory backend

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shale_core::{TargetMatch, DEFAULT_STATE_TABLE};
use shale_migrate::backends::lock_key;
use shale_migrate::{
    CancellationFlag, MemoryBackend, MigrateError, MigrationBackend, MigrationDirection, MigrationManager,
    MigrationRecord, MigrationRunner, MigrationStatus, Plan, RunnerOptions,
};

const CREATE_USERS: &str = "20190604_01_Vra0v-create-users-table";
const ADD_AGE: &str = "20190604_02_ORgoL-add-age-column-to-users-table";

fn users_fixture() -> Vec<MigrationRecord> {
    vec![
        MigrationRecord::new(CREATE_USERS)
            .forward("CREATE TABLE users (id INT, name VARCHAR(20), PRIMARY KEY (id))")
            .backward("DROP TABLE users"),
        MigrationRecord::new(ADD_AGE)
            .depends_on(CREATE_USERS)
            .forward("ALTER TABLE users ADD COLUMN age INT")
            .backward("ALTER TABLE users DROP COLUMN age"),
    ]
}

/// a <- b <- c, each creating its own table
fn chain() -> Vec<MigrationRecord> {
    vec![
        MigrationRecord::new("a")
            .forward("CREATE TABLE a (id INT)")
            .backward("DROP TABLE a"),
        MigrationRecord::new("b")
            .depends_on("a")
            .forward("CREATE TABLE b (id INT)")
            .backward("DROP TABLE b"),
        MigrationRecord::new("c")
            .depends_on("b")
            .forward("CREATE TABLE c (id INT)")
            .backward("DROP TABLE c"),
    ]
}

fn runner(backend: &MemoryBackend) -> MigrationRunner {
    MigrationRunner::new(Arc::new(backend.clone()))
}

fn ledger(backend: &MemoryBackend) -> Vec<String> {
    backend.ledger(DEFAULT_STATE_TABLE).unwrap()
}

#[tokio::test]
async fn test_fixture_apply_then_rollback_to_first() {
    let backend = MemoryBackend::new();
    let runner = runner(&backend);
    let records = users_fixture();

    let applied = runner.apply_pending(&records).await.unwrap();
    assert_eq!(applied.direction, MigrationDirection::Up);
    assert_eq!(applied.completed, [CREATE_USERS, ADD_AGE]);
    assert_eq!(
        backend.schema().unwrap().columns("users").unwrap(),
        ["id", "name", "age"]
    );

    let rolled_back = runner.rollback_to(CREATE_USERS, &records).await.unwrap();
    assert_eq!(rolled_back.direction, MigrationDirection::Down);
    assert_eq!(rolled_back.completed, [ADD_AGE, CREATE_USERS]);
    assert!(backend.schema().unwrap().is_empty());
    assert!(ledger(&backend).is_empty());
}

#[tokio::test]
async fn test_apply_pending_twice_executes_nothing_the_second_time() {
    let backend = MemoryBackend::new();
    let runner = runner(&backend);
    let records = users_fixture();

    runner.apply_pending(&records).await.unwrap();
    backend.clear_executed().unwrap();

    let second = runner.apply_pending(&records).await.unwrap();
    assert!(second.completed.is_empty());
    assert!(second.plan.is_empty());
    assert_eq!(second.skipped_count, 2);
    assert!(backend.executed_statements().unwrap().is_empty());
}

#[tokio::test]
async fn test_rollback_all_round_trips_to_empty() {
    let backend = MemoryBackend::new();
    let runner = runner(&backend);
    let records = chain();
    let before = backend.schema().unwrap();

    runner.apply_pending(&records).await.unwrap();
    let result = runner.rollback_all(&records).await.unwrap();

    assert_eq!(result.completed, ["c", "b", "a"]);
    assert!(ledger(&backend).is_empty());
    assert_eq!(backend.schema().unwrap(), before);
}

#[tokio::test]
async fn test_failed_step_halts_the_run() {
    let backend = MemoryBackend::new();
    let runner = runner(&backend);
    let records = vec![
        MigrationRecord::new("a").forward("CREATE TABLE a (id INT)"),
        MigrationRecord::new("b")
            .depends_on("a")
            .forward("CREATE TABLE b (id INT)")
            .forward("ALTER TABLE missing ADD COLUMN x INT"),
        MigrationRecord::new("c")
            .depends_on("b")
            .forward("CREATE TABLE c (id INT)"),
    ];

    let err = runner.apply_pending(&records).await.unwrap_err();
    match &err {
        MigrateError::StepExecution {
            migration,
            direction,
            progress,
            ..
        } => {
            assert_eq!(migration, "b");
            assert_eq!(*direction, MigrationDirection::Up);
            assert_eq!(progress.completed, ["a"]);
            assert_eq!(progress.not_attempted, ["c"]);
        }
        other => panic!("expected a step failure, got {other:?}"),
    }

    assert_eq!(ledger(&backend), ["a"]);
    let schema = backend.schema().unwrap();
    assert!(schema.has_table("a"));
    assert!(!schema.has_table("b"));
    assert!(!schema.has_table("c"));
}

#[tokio::test]
async fn test_failed_backward_step_halts_rollback_all() {
    let backend = MemoryBackend::new();
    let runner = runner(&backend);
    let records = chain();
    runner.apply_pending(&records).await.unwrap();
    backend.fail_statement("DROP TABLE b").unwrap();

    let err = runner.rollback_all(&records).await.unwrap_err();
    match &err {
        MigrateError::StepExecution {
            migration,
            direction,
            progress,
            ..
        } => {
            assert_eq!(migration, "b");
            assert_eq!(*direction, MigrationDirection::Down);
            assert_eq!(progress.completed, ["c"]);
            assert_eq!(progress.not_attempted, ["a"]);
        }
        other => panic!("expected a step failure, got {other:?}"),
    }

    assert_eq!(ledger(&backend), ["a", "b"]);
    let schema = backend.schema().unwrap();
    assert!(schema.has_table("a"));
    assert!(schema.has_table("b"));
    assert!(!schema.has_table("c"));
}

#[tokio::test]
async fn test_rollback_to_undoes_dependents_first() {
    let backend = MemoryBackend::new();
    let runner = runner(&backend);
    let records = chain();

    runner.apply_pending(&records).await.unwrap();
    let result = runner.rollback_to("a", &records).await.unwrap();

    assert_eq!(result.completed, ["c", "b", "a"]);
    assert!(ledger(&backend).is_empty());
}

#[tokio::test]
async fn test_rollback_to_leaves_unrelated_migrations_applied() {
    let backend = MemoryBackend::new();
    let runner = runner(&backend);
    let mut records = chain();
    records.push(MigrationRecord::new("x").forward("CREATE TABLE x (id INT)").backward("DROP TABLE x"));

    runner.apply_pending(&records).await.unwrap();
    let result = runner.rollback_to("b", &records).await.unwrap();

    assert_eq!(result.completed, ["c", "b"]);
    assert_eq!(ledger(&backend), ["a", "x"]);
}

#[tokio::test]
async fn test_target_resolution_modes() {
    let backend = MemoryBackend::new();
    let records = users_fixture();
    runner(&backend).apply_pending(&records).await.unwrap();

    let exact = runner(&backend);
    let err = exact.rollback_to("Vra0v", &records).await.unwrap_err();
    assert!(matches!(err, MigrateError::NoSuchTarget { ref revision } if revision == "Vra0v"));

    let substring = MigrationRunner::with_options(
        Arc::new(backend.clone()),
        RunnerOptions {
            target_match: TargetMatch::Substring,
            ..RunnerOptions::default()
        },
    );
    match substring.rollback_to("20190604", &records).await.unwrap_err() {
        MigrateError::AmbiguousTarget { candidates, .. } => {
            assert_eq!(candidates, [CREATE_USERS, ADD_AGE]);
        }
        other => panic!("expected an ambiguous target, got {other:?}"),
    }
    assert_eq!(ledger(&backend).len(), 2);

    let result = substring.rollback_to("ORgoL", &records).await.unwrap();
    assert_eq!(result.completed, [ADD_AGE]);
}

#[tokio::test]
async fn test_apply_to_applies_only_the_target_and_its_ancestors() {
    let backend = MemoryBackend::new();
    let runner = runner(&backend);
    let mut records = chain();
    records.push(MigrationRecord::new("x").forward("CREATE TABLE x (id INT)"));

    let result = runner.apply_to("b", &records).await.unwrap();
    assert_eq!(result.completed, ["a", "b"]);
    assert_eq!(ledger(&backend), ["a", "b"]);
}

#[tokio::test]
async fn test_cycle_fails_before_any_execution() {
    let backend = MemoryBackend::new();
    let records = vec![
        MigrationRecord::new("a").depends_on("b").forward("CREATE TABLE a (id INT)"),
        MigrationRecord::new("b").depends_on("a").forward("CREATE TABLE b (id INT)"),
    ];

    let err = runner(&backend).apply_pending(&records).await.unwrap_err();
    assert!(matches!(err, MigrateError::Cycle { .. }));
    assert!(backend.executed_statements().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancellation_is_honored_between_transactions() {
    let backend = MemoryBackend::new();
    let flag = CancellationFlag::new();
    let observer_flag = flag.clone();
    let runner = runner(&backend)
        .with_cancellation(flag)
        .with_plan_observer(Arc::new(move |_plan: &Plan| observer_flag.cancel()));

    match runner.apply_pending(&chain()).await.unwrap_err() {
        MigrateError::Cancelled { next, progress } => {
            assert_eq!(next, "a");
            assert!(progress.completed.is_empty());
            assert_eq!(progress.not_attempted, ["a", "b", "c"]);
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(ledger(&backend).is_empty());
}

#[tokio::test]
async fn test_held_lock_makes_the_run_fail() {
    let backend = MemoryBackend::new();
    backend.hold_lock(lock_key(DEFAULT_STATE_TABLE)).unwrap();

    let err = runner(&backend).apply_pending(&chain()).await.unwrap_err();
    assert!(matches!(err, MigrateError::LockUnavailable { .. }));
    assert!(backend.executed_statements().unwrap().is_empty());
}

#[tokio::test]
async fn test_runner_waits_for_the_lock_within_its_timeout() {
    let backend = MemoryBackend::new();
    let key = lock_key(DEFAULT_STATE_TABLE);
    backend.hold_lock(key).unwrap();

    let releaser = backend.clone();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        releaser.release_lock(key).await.unwrap();
    });

    let runner = MigrationRunner::with_options(
        Arc::new(backend.clone()),
        RunnerOptions {
            lock_timeout: Some(Duration::from_secs(5)),
            ..RunnerOptions::default()
        },
    );
    let result = runner.apply_pending(&chain()).await.unwrap();
    release.await.unwrap();

    assert_eq!(result.completed.len(), 3);
    assert!(!backend.is_locked(key).unwrap());
}

#[tokio::test]
async fn test_failed_state_write_rolls_back_the_step() {
    let backend = MemoryBackend::new();
    backend.fail_state_write("b").unwrap();

    let err = runner(&backend).apply_pending(&chain()).await.unwrap_err();
    assert!(matches!(err, MigrateError::StateInconsistency { .. }));
    assert_eq!(err.migration_id(), Some("b"));
    assert_eq!(err.progress().unwrap().completed, ["a"]);

    assert_eq!(ledger(&backend), ["a"]);
    assert!(!backend.schema().unwrap().has_table("b"));
}

#[tokio::test]
async fn test_commit_failure_that_did_not_persist_is_a_step_failure() {
    let backend = MemoryBackend::new();
    backend.fail_commit("b", false).unwrap();

    let err = runner(&backend).apply_pending(&chain()).await.unwrap_err();
    assert!(matches!(err, MigrateError::StepExecution { .. }));
    assert_eq!(err.migration_id(), Some("b"));
    assert_eq!(ledger(&backend), ["a"]);
}

#[tokio::test]
async fn test_commit_failure_that_persisted_is_an_inconsistency() {
    let backend = MemoryBackend::new();
    backend.fail_commit("b", true).unwrap();

    let err = runner(&backend).apply_pending(&chain()).await.unwrap_err();
    assert!(matches!(err, MigrateError::StateInconsistency { .. }));
    assert_eq!(err.migration_id(), Some("b"));
    assert_eq!(err.progress().unwrap().not_attempted, ["c"]);
    assert_eq!(ledger(&backend), ["a", "b"]);
}

#[tokio::test]
async fn test_unknown_applied_id_stops_the_run() {
    let backend = MemoryBackend::new();
    runner(&backend).apply_pending(&[]).await.unwrap();
    backend.insert_ledger_row(DEFAULT_STATE_TABLE, "ghost").unwrap();

    let err = runner(&backend).apply_pending(&chain()).await.unwrap_err();
    assert!(matches!(err, MigrateError::StateInconsistency { .. }));
    assert_eq!(err.migration_id(), Some("ghost"));
    assert!(backend.executed_statements().unwrap().is_empty());
}

#[tokio::test]
async fn test_dry_run_reports_the_plan_without_executing() {
    let backend = MemoryBackend::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);

    let runner = runner(&backend)
        .with_dry_run(true)
        .with_plan_observer(Arc::new(move |plan: &Plan| {
            observed.lock().unwrap().extend(plan.ids());
        }));
    let result = runner.apply_pending(&chain()).await.unwrap();

    assert!(result.dry_run);
    assert_eq!(result.plan, ["a", "b", "c"]);
    assert!(result.completed.is_empty());
    assert_eq!(*seen.lock().unwrap(), ["a", "b", "c"]);
    assert!(backend.executed_statements().unwrap().is_empty());
    assert!(ledger(&backend).is_empty());
}

#[tokio::test]
async fn test_read_only_calls_do_not_create_the_state_table() {
    let backend = MemoryBackend::new();
    let runner = runner(&backend);
    let records = chain();

    let status = runner.status(&records).await.unwrap();
    assert!(status.iter().all(|(_, status)| !status.is_applied()));
    assert_eq!(runner.plan_apply(&records).await.unwrap().ids(), ["a", "b", "c"]);
    assert!(runner.plan_rollback_all(&records).await.unwrap().ids().is_empty());

    assert!(!backend.state_table_exists(DEFAULT_STATE_TABLE).await.unwrap());
}

#[tokio::test]
async fn test_status_and_plans_reflect_the_ledger() {
    let backend = MemoryBackend::new();
    let runner = runner(&backend);
    let records = chain();

    runner.apply_to("a", &records).await.unwrap();

    let status = runner.status(&records).await.unwrap();
    let summary: Vec<(&str, bool)> = status
        .iter()
        .map(|(record, status)| (record.id(), status.is_applied()))
        .collect();
    assert_eq!(summary, [("a", true), ("b", false), ("c", false)]);
    assert!(matches!(status[1].1, MigrationStatus::Pending));

    assert_eq!(runner.plan_apply(&records).await.unwrap().ids(), ["b", "c"]);
    assert_eq!(runner.plan_apply_to("b", &records).await.unwrap().ids(), ["b"]);
    assert_eq!(runner.plan_rollback_all(&records).await.unwrap().ids(), ["a"]);
    assert_eq!(runner.plan_rollback_to("a", &records).await.unwrap().ids(), ["a"]);
}

#[tokio::test]
async fn test_fixture_directory_runs_end_to_end() {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
    let records = MigrationManager::new(dir).load_migrations().unwrap();

    let backend = MemoryBackend::new();
    let runner = runner(&backend);

    let applied = runner.apply_pending(&records).await.unwrap();
    assert_eq!(applied.completed, [CREATE_USERS, ADD_AGE]);
    assert_eq!(
        backend.schema().unwrap().columns("users").unwrap(),
        ["id", "name", "age"]
    );

    let rolled_back = runner.rollback_all(&records).await.unwrap();
    assert_eq!(rolled_back.completed, [ADD_AGE, CREATE_USERS]);
    assert!(backend.schema().unwrap().is_empty());
}
