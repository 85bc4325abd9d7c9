//! Database backends
//!
//! The runner talks to a database only through [`MigrationBackend`] and
//! [`BackendTransaction`].

pub mod core;
pub mod memory;
pub mod postgres;

pub use self::core::{lock_key, BackendTransaction, MigrationBackend};
pub use memory::{MemoryBackend, MemorySchema, MemoryTransaction};
pub use postgres::{create_state_table_sql, PostgresBackend, PostgresTransaction};
