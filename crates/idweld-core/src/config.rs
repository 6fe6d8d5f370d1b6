//! Environment-backed configuration helpers.
//!
//! Storage settings (pool sizing, database URL) live next to the pool in
//! `idweld-db`; this module provides the shared primitives: environment
//! reads and `sqlite://` URL parsing.

use std::env;
use std::path::PathBuf;

/// Read a configuration value from the process environment.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Parse the path component out of a `sqlite://` database URL.
///
/// Returns `None` for non-sqlite URLs. Query strings and fragments are
/// stripped.
fn sqlite_path_component(database_url: &str) -> Option<&str> {
    let url = database_url.trim();
    let stripped = url.strip_prefix("sqlite://")?;
    Some(stripped.split(['?', '#']).next().unwrap_or(stripped))
}

/// Return `true` when the database URL points to an in-memory `SQLite` database.
#[must_use]
pub fn is_sqlite_memory_database_url(database_url: &str) -> bool {
    matches!(
        sqlite_path_component(database_url),
        Some("/:memory:" | ":memory:")
    )
}

/// Parse a local `SQLite` file path from a database URL.
///
/// Returns `None` for in-memory DBs or non-sqlite URLs.
#[must_use]
pub fn sqlite_file_path_from_database_url(database_url: &str) -> Option<PathBuf> {
    let stripped = sqlite_path_component(database_url)?;

    if stripped.is_empty() || is_sqlite_memory_database_url(database_url) {
        return None;
    }

    // After stripping, examples:
    // - //abs/path.db     -> /abs/path.db
    // - /relative/path.db -> relative/path.db
    // - relative/path.db  -> relative/path.db
    let mut path = stripped.to_string();
    if path.starts_with("//") || path.starts_with('/') {
        path.remove(0);
    }

    if path.is_empty() {
        return None;
    }

    Some(PathBuf::from(path))
}
