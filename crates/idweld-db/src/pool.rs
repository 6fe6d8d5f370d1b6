//! Connection pool configuration and initialization
//!
//! Uses `sqlmodel_pool` for connection management. Each identify request
//! checks out one exclusive connection and runs one transaction on it.

use crate::DbConn;
use crate::error::{DbError, DbResult};
use crate::schema;
use asupersync::sync::OnceCell;
use asupersync::{Cx, Outcome};
use idweld_core::config::{
    env_value, is_sqlite_memory_database_url, sqlite_file_path_from_database_url,
};
use sqlmodel_core::Error as SqlError;
use sqlmodel_pool::{Pool, PoolConfig, PooledConnection};
use std::path::Path;
use std::sync::Arc;

/// Default pool configuration values.
///
/// Identify is a write path that takes the `SQLite` write lock at
/// transaction start, so writers serialize regardless of pool size; the
/// pool mainly needs enough connections that read helpers and concurrent
/// requests don't queue on checkout.
pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_MAX_OVERFLOW: usize = 15;
pub const DEFAULT_POOL_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_POOL_RECYCLE_MS: u64 = 30 * 60 * 1000; // 30 minutes

/// Auto-detect a reasonable pool size from available CPU parallelism.
///
/// Returns `(min_connections, max_connections)`. Used when
/// `DATABASE_POOL_SIZE=auto` (the default when no explicit size is given).
#[must_use]
pub fn auto_pool_size() -> (usize, usize) {
    let cpus = std::thread::available_parallelism().map_or(4, std::num::NonZero::get);
    let min = (cpus * 2).clamp(4, 16);
    let max = (cpus * 8).clamp(16, 64);
    (min, max)
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct DbPoolConfig {
    /// Database URL (`sqlite:///path/to/db.sqlite3`)
    pub database_url: String,
    /// Minimum connections to keep open
    pub min_connections: usize,
    /// Maximum connections
    pub max_connections: usize,
    /// Timeout for acquiring a connection (ms)
    pub acquire_timeout_ms: u64,
    /// Max connection lifetime (ms)
    pub max_lifetime_ms: u64,
    /// Run migrations on init
    pub run_migrations: bool,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:///./idweld.sqlite3".to_string(),
            min_connections: DEFAULT_POOL_SIZE,
            max_connections: DEFAULT_POOL_SIZE + DEFAULT_MAX_OVERFLOW,
            acquire_timeout_ms: DEFAULT_POOL_TIMEOUT_MS,
            max_lifetime_ms: DEFAULT_POOL_RECYCLE_MS,
            run_migrations: true,
        }
    }
}

impl DbPoolConfig {
    /// Create config from environment.
    ///
    /// Pool sizing honours two strategies in priority order: explicit
    /// `DATABASE_POOL_SIZE`/`DATABASE_MAX_OVERFLOW` values, else
    /// [`auto_pool_size()`] from CPU count.
    #[must_use]
    pub fn from_env() -> Self {
        let database_url = env_value("DATABASE_URL")
            .unwrap_or_else(|| "sqlite:///./idweld.sqlite3".to_string());

        let pool_timeout = env_value("DATABASE_POOL_TIMEOUT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_POOL_TIMEOUT_MS);

        let explicit_size = env_value("DATABASE_POOL_SIZE").and_then(|s| s.parse::<usize>().ok());
        let explicit_overflow =
            env_value("DATABASE_MAX_OVERFLOW").and_then(|s| s.parse::<usize>().ok());

        let (min_conn, max_conn) = match (explicit_size, explicit_overflow) {
            (Some(size), Some(overflow)) => (size, size + overflow),
            (Some(size), None) => (size, size + DEFAULT_MAX_OVERFLOW),
            (None, maybe_overflow) => {
                let (auto_min, auto_max) = auto_pool_size();
                maybe_overflow.map_or((auto_min, auto_max), |overflow| {
                    (auto_min, auto_min + overflow)
                })
            }
        };

        Self {
            database_url,
            min_connections: min_conn,
            max_connections: max_conn,
            acquire_timeout_ms: pool_timeout,
            max_lifetime_ms: DEFAULT_POOL_RECYCLE_MS,
            run_migrations: true,
        }
    }

    /// Parse `SQLite` path from database URL
    pub fn sqlite_path(&self) -> DbResult<String> {
        if is_sqlite_memory_database_url(&self.database_url) {
            return Ok(":memory:".to_string());
        }

        let Some(path) = sqlite_file_path_from_database_url(&self.database_url) else {
            return Err(DbError::InvalidArgument {
                field: "database_url",
                message: format!(
                    "Invalid SQLite database URL: {} (expected sqlite:///path/to/db.sqlite3)",
                    self.database_url
                ),
            });
        };

        Ok(path.to_string_lossy().into_owned())
    }
}

/// Connection pool over the `SQLite` store.
#[derive(Clone)]
pub struct DbPool {
    pool: Arc<Pool<DbConn>>,
    sqlite_path: String,
    run_migrations: bool,
    /// One-shot gate: schema init runs once per pool, before the first
    /// connection is handed out.
    init_gate: Arc<OnceCell<()>>,
}

impl DbPool {
    /// Create a new pool (does not open connections until first acquire).
    pub fn new(config: &DbPoolConfig) -> DbResult<Self> {
        let sqlite_path = config.sqlite_path()?;

        let pool_config = PoolConfig::new(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout_ms)
            .max_lifetime(config.max_lifetime_ms)
            .test_on_checkout(true)
            .test_on_return(false);

        Ok(Self {
            pool: Arc::new(Pool::new(pool_config)),
            sqlite_path,
            run_migrations: config.run_migrations,
            init_gate: Arc::new(OnceCell::new()),
        })
    }

    #[must_use]
    pub fn sqlite_path(&self) -> &str {
        &self.sqlite_path
    }

    /// Acquire a pooled connection, creating and initializing a new one if
    /// needed. The connection returns to the pool when the guard drops,
    /// on every exit path.
    pub async fn acquire(&self, cx: &Cx) -> Outcome<PooledConnection<DbConn>, SqlError> {
        let sqlite_path = self.sqlite_path.clone();
        let run_migrations = self.run_migrations;
        let init_gate = Arc::clone(&self.init_gate);
        let cx2 = cx.clone();

        self.pool
            .acquire(cx, || {
                let sqlite_path = sqlite_path.clone();
                let init_gate = Arc::clone(&init_gate);
                let cx2 = cx2.clone();
                async move {
                    // In-memory databases are private to one connection, so
                    // each gets the full schema. Meant for tests/dev with a
                    // single-connection pool.
                    if sqlite_path == ":memory:" {
                        let conn = match DbConn::open_file(&sqlite_path) {
                            Ok(c) => c,
                            Err(e) => return Outcome::Err(e),
                        };
                        if let Err(e) = conn.execute_raw(&schema::init_schema_sql()) {
                            return Outcome::Err(e);
                        }
                        return Outcome::Ok(conn);
                    }

                    // Ensure parent directory exists for file-backed DBs.
                    if let Some(parent) = Path::new(&sqlite_path).parent() {
                        if !parent.as_os_str().is_empty() {
                            if let Err(e) = std::fs::create_dir_all(parent) {
                                return Outcome::Err(SqlError::Custom(format!(
                                    "failed to create db dir {}: {e}",
                                    parent.display()
                                )));
                            }
                        }
                    }

                    // DB-wide init (migrations) runs once per pool, on a
                    // dedicated connection that is closed before regular
                    // traffic starts.
                    let gate_out = init_gate
                        .get_or_try_init(|| {
                            let cx2 = cx2.clone();
                            let sqlite_path = sqlite_path.clone();
                            async move {
                                let mig_conn = DbConn::open_file(&sqlite_path)
                                    .map_err(Outcome::<(), SqlError>::Err)?;
                                if let Err(e) = mig_conn.execute_raw(schema::PRAGMA_SETTINGS_SQL) {
                                    return Err(Outcome::Err(e));
                                }
                                if run_migrations {
                                    match schema::migrate_to_latest(&cx2, &mig_conn).await {
                                        Outcome::Ok(applied) => {
                                            if !applied.is_empty() {
                                                tracing::info!(
                                                    count = applied.len(),
                                                    "applied schema migrations"
                                                );
                                            }
                                        }
                                        Outcome::Err(e) => return Err(Outcome::Err(e)),
                                        Outcome::Cancelled(r) => {
                                            return Err(Outcome::Cancelled(r));
                                        }
                                        Outcome::Panicked(p) => {
                                            return Err(Outcome::Panicked(p));
                                        }
                                    }
                                }
                                drop(mig_conn);
                                Ok(())
                            }
                        })
                        .await;

                    match gate_out {
                        Ok(()) => {}
                        Err(Outcome::Err(e)) => return Outcome::Err(e),
                        Err(Outcome::Cancelled(r)) => return Outcome::Cancelled(r),
                        Err(Outcome::Panicked(p)) => return Outcome::Panicked(p),
                        Err(Outcome::Ok(())) => {
                            unreachable!("sqlite init gate returned Err(Outcome::Ok(()))")
                        }
                    }

                    let conn = match DbConn::open_file(&sqlite_path) {
                        Ok(c) => c,
                        Err(e) => return Outcome::Err(e),
                    };

                    // Per-connection PRAGMAs.
                    if let Err(e) = conn.execute_raw(schema::PRAGMA_SETTINGS_SQL) {
                        return Outcome::Err(e);
                    }

                    Outcome::Ok(conn)
                }
            })
            .await
    }
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool")
            .field("sqlite_path", &self.sqlite_path)
            .field("run_migrations", &self.run_migrations)
            .finish_non_exhaustive()
    }
}

/// Create a pool from config.
pub fn create_pool(config: &DbPoolConfig) -> DbResult<DbPool> {
    DbPool::new(config)
}
