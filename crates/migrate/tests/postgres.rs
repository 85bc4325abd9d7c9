//! PostgreSQL round trip; runs only when TEST_DATABASE_URL is set

use std::sync::Arc;

use shale_migrate::{MigrationRecord, MigrationRunner, PostgresBackend, RunnerOptions};

fn database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok()
}

#[tokio::test]
async fn test_postgres_apply_and_rollback() {
    let Some(url) = database_url() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };

    let backend = PostgresBackend::connect(&url, None).await.unwrap();
    let runner = MigrationRunner::with_options(
        Arc::new(backend),
        RunnerOptions {
            state_table: "shale_test_migrations".to_string(),
            ..RunnerOptions::default()
        },
    );

    let records = vec![
        MigrationRecord::new("0001_shale_people")
            .forward("CREATE TABLE shale_people (id INT, name VARCHAR(20), PRIMARY KEY (id))")
            .backward("DROP TABLE shale_people"),
        MigrationRecord::new("0002_shale_people_age")
            .depends_on("0001_shale_people")
            .forward("ALTER TABLE shale_people ADD COLUMN age INT")
            .backward("ALTER TABLE shale_people DROP COLUMN age"),
    ];

    runner.rollback_all(&records).await.unwrap();

    let applied = runner.apply_pending(&records).await.unwrap();
    assert_eq!(applied.completed, ["0001_shale_people", "0002_shale_people_age"]);
    assert!(runner.apply_pending(&records).await.unwrap().completed.is_empty());

    let rolled_back = runner.rollback_to("0001_shale_people", &records).await.unwrap();
    assert_eq!(rolled_back.completed, ["0002_shale_people_age", "0001_shale_people"]);
    assert!(runner.state().all_applied().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_postgres_failed_step_leaves_no_bookkeeping_row() {
    let Some(url) = database_url() else {
        return;
    };

    let backend = PostgresBackend::connect(&url, None).await.unwrap();
    let runner = MigrationRunner::with_options(
        Arc::new(backend),
        RunnerOptions {
            state_table: "shale_test_failures".to_string(),
            ..RunnerOptions::default()
        },
    );

    let records = vec![MigrationRecord::new("0001_broken")
        .forward("CREATE TABLE shale_broken (id INT)")
        .forward("ALTER TABLE shale_no_such_table ADD COLUMN x INT")];

    let err = runner.apply_pending(&records).await.unwrap_err();
    assert_eq!(err.migration_id(), Some("0001_broken"));
    assert!(!runner.state().is_applied("0001_broken").await.unwrap());
}
