//! Storage layer and consolidation engine for idweld
//!
//! This crate provides:
//! - The `contacts` table model via `sqlmodel`
//! - Connection pooling over `SQLite`
//! - Tracked schema migrations
//! - The `identify` operation: lookup, cluster expansion, collision
//!   resolution, novelty detection, and projection in one atomic
//!   transaction
//!
//! # Timestamp Convention
//!
//! All timestamps are stored as `i64` (microseconds since Unix epoch).
//! Helper functions convert to/from `chrono::NaiveDateTime`.

#![forbid(unsafe_code)]

pub mod error;
pub mod identify;
pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;
pub mod timestamps;

pub use error::{DbError, DbResult, is_lock_error};
pub use identify::{RetryMetrics, identify, retry_metrics};
pub use models::{ContactRow, PRECEDENCE_PRIMARY, PRECEDENCE_SECONDARY};
pub use pool::{DbPool, DbPoolConfig, auto_pool_size, create_pool};
pub use queries::{count_contacts, fetch_cluster_of, get_contact, tombstone_contact};
pub use schema::{SCHEMA_VERSION, init_schema_sql, migrate_to_latest, migration_status};
pub use timestamps::{micros_to_naive, naive_to_micros, now_micros};

// Re-export the storage substrate for consumers (tests, a server crate).
pub use sqlmodel;
pub use sqlmodel_core;

/// The connection type used by this crate's pool and queries.
pub type DbConn = sqlmodel_sqlite::SqliteConnection;
