//! # shale-migrate
//!
//! Dependency-ordered schema migrations with per-migration transactions.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shale_migrate::{MemoryBackend, MigrationRecord, MigrationRunner};
//!
//! # async fn demo() -> shale_migrate::MigrateResult<()> {
//! let records = vec![
//!     MigrationRecord::new("create-users")
//!         .forward("CREATE TABLE users (id INT, name VARCHAR(20), PRIMARY KEY (id))")
//!         .backward("DROP TABLE users"),
//!     MigrationRecord::new("add-age")
//!         .depends_on("create-users")
//!         .forward("ALTER TABLE users ADD COLUMN age INT")
//!         .backward("ALTER TABLE users DROP COLUMN age"),
//! ];
//!
//! let runner = MigrationRunner::new(Arc::new(MemoryBackend::new()));
//! runner.apply_pending(&records).await?;
//! runner.rollback_to("create-users", &records).await?;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod error;
pub mod migrations;

pub use backends::{BackendTransaction, MemoryBackend, MigrationBackend, PostgresBackend};
pub use error::{MigrateError, MigrateResult, Progress};
pub use migrations::*;
