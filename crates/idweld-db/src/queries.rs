//! Storage access primitives for the consolidation engine
//!
//! Raw parameterized SQL plus indexed row decoding. These functions are the
//! "DB truth" for the engine: `identify` composes them inside one
//! transaction rather than embedding SQL of its own.

use std::collections::BTreeSet;

use asupersync::{Cx, Outcome};
use sqlmodel_core::{Connection, Error as SqlError, Row as SqlRow, Value};
use sqlmodel_query::{raw_execute, raw_query};

use idweld_core::IdentityInput;

use crate::DbConn;
use crate::error::DbError;
use crate::models::{ContactRow, PRECEDENCE_SECONDARY};
use crate::pool::DbPool;
use crate::timestamps::now_micros;

// =============================================================================
// Decode helpers
// =============================================================================

pub(crate) fn map_sql_error(e: &SqlError) -> DbError {
    DbError::Sqlite(e.to_string())
}

pub(crate) fn map_sql_outcome<T>(out: Outcome<T, SqlError>) -> Outcome<T, DbError> {
    match out {
        Outcome::Ok(v) => Outcome::Ok(v),
        Outcome::Err(e) => Outcome::Err(map_sql_error(&e)),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Lift a plain `Result` into the transaction `Outcome` flow.
pub(crate) fn res<T>(r: Result<T, DbError>) -> Outcome<T, DbError> {
    match r {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::BigInt(n) => Some(*n),
        Value::Int(n) => Some(i64::from(*n)),
        Value::SmallInt(n) => Some(i64::from(*n)),
        Value::TinyInt(n) => Some(i64::from(*n)),
        _ => None,
    }
}

pub(crate) fn row_first_i64(row: &SqlRow) -> Option<i64> {
    row.get(0).and_then(value_as_i64)
}

fn get_opt_i64(row: &SqlRow, idx: usize) -> Option<i64> {
    row.get(idx).and_then(value_as_i64)
}

fn get_i64(row: &SqlRow, idx: usize) -> i64 {
    get_opt_i64(row, idx).unwrap_or(0)
}

fn get_opt_string(row: &SqlRow, idx: usize) -> Option<String> {
    row.get(idx).and_then(|v| match v {
        Value::Text(s) => Some(s.clone()),
        _ => None,
    })
}

/// Column order used by every contact SELECT in this crate.
pub(crate) const CONTACT_SELECT_COLUMNS_SQL: &str =
    "SELECT id, email, phone_number, link_precedence, linked_id, created_at, updated_at, deleted_at \
     FROM contacts";

/// Decode `ContactRow` from raw SQL query result using positional (indexed)
/// column access, in [`CONTACT_SELECT_COLUMNS_SQL`] order.
pub(crate) fn decode_contact_row_indexed(row: &SqlRow) -> Result<ContactRow, DbError> {
    let id = get_opt_i64(row, 0);
    if id.is_none() {
        return Err(DbError::Internal(
            "contact row decoded without an id column".to_string(),
        ));
    }
    let link_precedence = get_opt_string(row, 3).ok_or_else(|| {
        DbError::Internal("contact row decoded without link_precedence".to_string())
    })?;

    Ok(ContactRow {
        id,
        email: get_opt_string(row, 1),
        phone_number: get_opt_string(row, 2),
        link_precedence,
        linked_id: get_opt_i64(row, 4),
        created_at: get_i64(row, 5),
        updated_at: get_i64(row, 6),
        deleted_at: get_opt_i64(row, 7),
    })
}

fn decode_contact_rows(rows: &[SqlRow]) -> Result<Vec<ContactRow>, DbError> {
    rows.iter().map(decode_contact_row_indexed).collect()
}

/// `SQLite` default `SQLITE_MAX_VARIABLE_NUMBER` is 999. IN-clause item
/// counts are capped well below that; identity clusters are tiny compared
/// to the limit.
const MAX_IN_CLAUSE_ITEMS: usize = 500;

fn placeholders(count: usize) -> String {
    let capped = count.min(MAX_IN_CLAUSE_ITEMS);
    std::iter::repeat_n("?", capped)
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) async fn acquire_conn(
    cx: &Cx,
    pool: &DbPool,
) -> Outcome<sqlmodel_pool::PooledConnection<DbConn>, DbError> {
    map_sql_outcome(pool.acquire(cx).await)
}

// =============================================================================
// Transaction helpers
// =============================================================================

/// Begin an immediate write transaction (single-writer semantics).
///
/// `BEGIN IMMEDIATE` takes the write lock up front, so two requests racing
/// to merge the same clusters serialize here instead of deadlocking at
/// commit.
pub(crate) async fn begin_immediate_tx(cx: &Cx, conn: &DbConn) -> Outcome<(), DbError> {
    map_sql_outcome(conn.execute(cx, "BEGIN IMMEDIATE", &[]).await).map(|_| ())
}

/// Commit the current transaction.
pub(crate) async fn commit_tx(cx: &Cx, conn: &DbConn) -> Outcome<(), DbError> {
    map_sql_outcome(conn.execute(cx, "COMMIT", &[]).await).map(|_| ())
}

/// Rollback the current transaction (best-effort, errors ignored).
pub(crate) async fn rollback_tx(cx: &Cx, conn: &DbConn) {
    let _ = conn.execute(cx, "ROLLBACK", &[]).await;
}

/// Unwrap an `Outcome` inside a transaction: on non-`Ok`, rollback and
/// return early.
///
/// Usage: `let val = try_in_tx!(cx, conn, some_outcome_expr);`
macro_rules! try_in_tx {
    ($cx:expr, $conn:expr, $out:expr) => {
        match $out {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => {
                $crate::queries::rollback_tx($cx, $conn).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                $crate::queries::rollback_tx($cx, $conn).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                $crate::queries::rollback_tx($cx, $conn).await;
                return Outcome::Panicked(p);
            }
        }
    };
}
pub(crate) use try_in_tx;

// =============================================================================
// Contact primitives (used inside the identify transaction)
// =============================================================================

/// All non-deleted contacts whose email or phone exactly matches the input.
///
/// A predicate is skipped entirely when its field is absent — NULL never
/// matches. Ordered by creation.
pub(crate) async fn lookup_matches(
    cx: &Cx,
    conn: &DbConn,
    input: &IdentityInput,
) -> Outcome<Vec<ContactRow>, DbError> {
    let mut predicates: Vec<&str> = Vec::with_capacity(2);
    let mut params: Vec<Value> = Vec::with_capacity(2);
    if let Some(email) = &input.email {
        predicates.push("email = ?");
        params.push(Value::Text(email.clone()));
    }
    if let Some(phone) = &input.phone {
        predicates.push("phone_number = ?");
        params.push(Value::Text(phone.clone()));
    }
    debug_assert!(!predicates.is_empty(), "caller validates the input first");

    let sql = format!(
        "{CONTACT_SELECT_COLUMNS_SQL} WHERE deleted_at IS NULL AND ({}) \
         ORDER BY created_at ASC, id ASC",
        predicates.join(" OR ")
    );

    match map_sql_outcome(raw_query(cx, conn, &sql, &params).await) {
        Outcome::Ok(rows) => res(decode_contact_rows(&rows)),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// The full cluster for a set of governing primary ids: the primaries plus
/// every secondary pointing at them, ordered by creation.
pub(crate) async fn fetch_cluster(
    cx: &Cx,
    conn: &DbConn,
    primary_ids: &BTreeSet<i64>,
) -> Outcome<Vec<ContactRow>, DbError> {
    if primary_ids.is_empty() {
        return Outcome::Ok(Vec::new());
    }

    let marks = placeholders(primary_ids.len());
    let sql = format!(
        "{CONTACT_SELECT_COLUMNS_SQL} WHERE deleted_at IS NULL \
         AND (id IN ({marks}) OR linked_id IN ({marks})) \
         ORDER BY created_at ASC, id ASC"
    );
    let mut params: Vec<Value> = Vec::with_capacity(primary_ids.len() * 2);
    params.extend(primary_ids.iter().copied().map(Value::BigInt));
    params.extend(primary_ids.iter().copied().map(Value::BigInt));

    match map_sql_outcome(raw_query(cx, conn, &sql, &params).await) {
        Outcome::Ok(rows) => res(decode_contact_rows(&rows)),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Re-point every live secondary of `old_primary_id` at `new_primary_id`
/// (bulk re-parent), bumping `updated_at`. Returns the affected row count.
pub(crate) async fn reparent_secondaries(
    cx: &Cx,
    conn: &DbConn,
    old_primary_id: i64,
    new_primary_id: i64,
    now: i64,
) -> Outcome<u64, DbError> {
    let sql = "UPDATE contacts SET linked_id = ?, updated_at = ? \
               WHERE linked_id = ? AND deleted_at IS NULL";
    let params = [
        Value::BigInt(new_primary_id),
        Value::BigInt(now),
        Value::BigInt(old_primary_id),
    ];
    map_sql_outcome(raw_execute(cx, conn, sql, &params).await)
}

/// Demote a junior primary to secondary of `new_primary_id`, bumping
/// `updated_at`. `created_at`, `email`, and `phone_number` are untouched.
pub(crate) async fn demote_primary(
    cx: &Cx,
    conn: &DbConn,
    loser_id: i64,
    new_primary_id: i64,
    now: i64,
) -> Outcome<(), DbError> {
    let sql = "UPDATE contacts SET link_precedence = ?, linked_id = ?, updated_at = ? \
               WHERE id = ?";
    let params = [
        Value::Text(PRECEDENCE_SECONDARY.to_string()),
        Value::BigInt(new_primary_id),
        Value::BigInt(now),
        Value::BigInt(loser_id),
    ];
    map_sql_outcome(raw_execute(cx, conn, sql, &params).await).map(|_| ())
}

/// Read back the id assigned by the most recent INSERT on this connection.
pub(crate) async fn last_insert_id(cx: &Cx, conn: &DbConn) -> Outcome<i64, DbError> {
    match map_sql_outcome(raw_query(cx, conn, "SELECT last_insert_rowid()", &[]).await) {
        Outcome::Ok(rows) => rows.first().and_then(row_first_i64).map_or_else(
            || {
                Outcome::Err(DbError::Internal(
                    "insert succeeded but last_insert_rowid() returned no row".to_string(),
                ))
            },
            Outcome::Ok,
        ),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

// =============================================================================
// Standalone reads & operator helpers
// =============================================================================

/// Get one contact by id (tombstone-filtered).
pub async fn get_contact(cx: &Cx, pool: &DbPool, id: i64) -> Outcome<ContactRow, DbError> {
    let conn = match acquire_conn(cx, pool).await {
        Outcome::Ok(c) => c,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let sql = format!("{CONTACT_SELECT_COLUMNS_SQL} WHERE id = ? AND deleted_at IS NULL");
    match map_sql_outcome(raw_query(cx, &*conn, &sql, &[Value::BigInt(id)]).await) {
        Outcome::Ok(rows) => rows.first().map_or_else(
            || Outcome::Err(DbError::not_found("contact", id.to_string())),
            |row| res(decode_contact_row_indexed(row)),
        ),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Read-only view of the cluster a contact belongs to, ordered by creation.
///
/// Diagnostic surface: follows the same two-pass expansion the engine uses,
/// without taking a write transaction.
pub async fn fetch_cluster_of(
    cx: &Cx,
    pool: &DbPool,
    contact_id: i64,
) -> Outcome<Vec<ContactRow>, DbError> {
    let contact = match get_contact(cx, pool, contact_id).await {
        Outcome::Ok(c) => c,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let snapshot = match contact.snapshot() {
        Ok(s) => s,
        Err(e) => return Outcome::Err(DbError::from(e)),
    };

    let conn = match acquire_conn(cx, pool).await {
        Outcome::Ok(c) => c,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let seed: BTreeSet<i64> = [snapshot.governing_primary_id()].into();
    fetch_cluster(cx, &*conn, &seed).await
}

/// Count non-deleted contacts.
pub async fn count_contacts(cx: &Cx, pool: &DbPool) -> Outcome<i64, DbError> {
    let conn = match acquire_conn(cx, pool).await {
        Outcome::Ok(c) => c,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let sql = "SELECT COUNT(*) FROM contacts WHERE deleted_at IS NULL";
    match map_sql_outcome(raw_query(cx, &*conn, sql, &[]).await) {
        Outcome::Ok(rows) => Outcome::Ok(rows.first().and_then(row_first_i64).unwrap_or(0)),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Operator-facing soft delete: set the tombstone on one contact.
///
/// The consolidation engine never calls this itself; tombstoned rows are
/// simply invisible to every read it performs.
pub async fn tombstone_contact(cx: &Cx, pool: &DbPool, id: i64) -> Outcome<(), DbError> {
    let conn = match acquire_conn(cx, pool).await {
        Outcome::Ok(c) => c,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let now = now_micros();
    let sql = "UPDATE contacts SET deleted_at = ?, updated_at = ? \
               WHERE id = ? AND deleted_at IS NULL";
    let params = [Value::BigInt(now), Value::BigInt(now), Value::BigInt(id)];
    match map_sql_outcome(raw_execute(cx, &*conn, sql, &params).await) {
        Outcome::Ok(0) => Outcome::Err(DbError::not_found("contact", id.to_string())),
        Outcome::Ok(_) => {
            tracing::debug!(contact_id = id, "tombstoned contact");
            Outcome::Ok(())
        }
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}
