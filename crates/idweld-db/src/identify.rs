//! The consolidation engine
//!
//! One identify call = one `BEGIN IMMEDIATE` transaction running the full
//! pipeline: lookup → cluster expansion → collision resolution →
//! novelty/creation → projection. The pure steps live in
//! `idweld_core::cluster`; this module feeds them snapshots and persists
//! the planned mutations. Any failure rolls the whole transaction back.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use asupersync::{Cx, Outcome};
use sqlmodel::prelude::*;

use idweld_core::cluster::{self, ContactSnapshot};
use idweld_core::{ConsolidatedContact, IdentityInput};

use crate::DbConn;
use crate::error::DbError;
use crate::models::ContactRow;
use crate::pool::DbPool;
use crate::queries::{
    acquire_conn, begin_immediate_tx, commit_tx, demote_primary, fetch_cluster, last_insert_id,
    lookup_matches, map_sql_outcome, reparent_secondaries, res, try_in_tx,
};
use crate::timestamps::now_micros;

/// Attempts per identify call when the storage layer reports lock
/// contention after `busy_timeout` expired.
const MAX_BUSY_ATTEMPTS: u32 = 3;

static BUSY_RETRIES: AtomicU64 = AtomicU64::new(0);
static BUSY_GIVE_UPS: AtomicU64 = AtomicU64::new(0);

/// Snapshot of lock-contention retry counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryMetrics {
    pub busy_retries: u64,
    pub busy_give_ups: u64,
}

/// Return a snapshot of the identify retry counters.
#[must_use]
pub fn retry_metrics() -> RetryMetrics {
    RetryMetrics {
        busy_retries: BUSY_RETRIES.load(Ordering::Relaxed),
        busy_give_ups: BUSY_GIVE_UPS.load(Ordering::Relaxed),
    }
}

/// Resolve an identify request to its consolidated contact view.
///
/// Precondition: at least one identifier non-blank after trimming;
/// violations are rejected before any storage access. Lock-contention
/// failures re-run the whole transaction (bounded); every other error
/// propagates immediately with the transaction rolled back.
pub async fn identify(
    cx: &Cx,
    pool: &DbPool,
    email: Option<&str>,
    phone: Option<&str>,
) -> Outcome<ConsolidatedContact, DbError> {
    let input = IdentityInput::new(email, phone);
    if let Err(e) = input.validate() {
        return Outcome::Err(DbError::invalid("identifier", e.to_string()));
    }

    let mut attempt = 1;
    loop {
        match identify_once(cx, pool, &input).await {
            Outcome::Err(e) if e.is_retryable() && attempt < MAX_BUSY_ATTEMPTS => {
                BUSY_RETRIES.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    attempt,
                    error = %e,
                    "identify transaction hit lock contention; retrying"
                );
                attempt += 1;
            }
            Outcome::Err(e) if e.is_retryable() => {
                BUSY_GIVE_UPS.fetch_add(1, Ordering::Relaxed);
                return Outcome::Err(e);
            }
            other => return other,
        }
    }
}

async fn identify_once(
    cx: &Cx,
    pool: &DbPool,
    input: &IdentityInput,
) -> Outcome<ConsolidatedContact, DbError> {
    let conn = match acquire_conn(cx, pool).await {
        Outcome::Ok(c) => c,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };
    let conn: &DbConn = &conn;

    try_in_tx!(cx, conn, begin_immediate_tx(cx, conn).await);

    // 1. Lookup.
    let matches = try_in_tx!(cx, conn, lookup_matches(cx, conn, input).await);

    // No match at all: a brand-new customer. No expansion or collision
    // step applies.
    if matches.is_empty() {
        let view = try_in_tx!(cx, conn, create_fresh_primary(cx, conn, input).await);
        try_in_tx!(cx, conn, commit_tx(cx, conn).await);
        return Outcome::Ok(view);
    }

    // 2. Cluster expansion: matched contacts → governing primaries → full
    // cluster.
    let matched = try_in_tx!(cx, conn, res(snapshots_of(&matches)));
    let primary_ids = cluster::governing_primary_ids(&matched);
    let rows = try_in_tx!(cx, conn, fetch_cluster(cx, conn, &primary_ids).await);
    let mut snapshots = try_in_tx!(cx, conn, res(snapshots_of(&rows)));
    try_in_tx!(
        cx,
        conn,
        res(cluster::validate(&snapshots).map_err(DbError::from))
    );

    // 3. Collision resolution: the input may have bridged previously
    // independent clusters. Oldest primary wins; re-expand afterwards
    // because membership changed.
    let plan = try_in_tx!(cx, conn, res(cluster::plan_merge(&snapshots).map_err(DbError::from)));
    if plan.needs_merge() {
        let now = now_micros();
        for loser_id in &plan.loser_ids {
            try_in_tx!(
                cx,
                conn,
                reparent_secondaries(cx, conn, *loser_id, plan.true_primary_id, now).await
            );
            try_in_tx!(
                cx,
                conn,
                demote_primary(cx, conn, *loser_id, plan.true_primary_id, now).await
            );
        }
        tracing::info!(
            true_primary_id = plan.true_primary_id,
            demoted = plan.loser_ids.len(),
            "merged bridged identity clusters"
        );

        let seed: BTreeSet<i64> = [plan.true_primary_id].into();
        let rows = try_in_tx!(cx, conn, fetch_cluster(cx, conn, &seed).await);
        snapshots = try_in_tx!(cx, conn, res(snapshots_of(&rows)));
    }
    let true_primary_id = plan.true_primary_id;

    // 4. Novelty: create exactly one secondary when the input carries an
    // identifier the cluster has never seen.
    if cluster::is_novel(&snapshots, input) {
        let row = ContactRow::new_secondary(
            input.email.clone(),
            input.phone.clone(),
            true_primary_id,
        );
        try_in_tx!(
            cx,
            conn,
            map_sql_outcome(insert!(&row).execute(cx, conn).await)
        );
        let id = try_in_tx!(cx, conn, last_insert_id(cx, conn).await);
        tracing::debug!(contact_id = id, true_primary_id, "created secondary contact");
        snapshots.push(ContactSnapshot {
            id,
            email: row.email.clone(),
            phone: row.phone_number.clone(),
            linkage: cluster::Linkage::Secondary {
                owner_id: true_primary_id,
            },
            created_at: row.created_at,
        });
    }

    // 5. Projection.
    let view = try_in_tx!(
        cx,
        conn,
        res(cluster::project(&snapshots, true_primary_id).map_err(DbError::from))
    );
    try_in_tx!(cx, conn, commit_tx(cx, conn).await);
    Outcome::Ok(view)
}

/// Insert a fresh primary for an input that matched nothing and build its
/// singleton projection.
async fn create_fresh_primary(
    cx: &Cx,
    conn: &DbConn,
    input: &IdentityInput,
) -> Outcome<ConsolidatedContact, DbError> {
    let row = ContactRow::new_primary(input.email.clone(), input.phone.clone());
    match map_sql_outcome(insert!(&row).execute(cx, conn).await) {
        Outcome::Ok(_) => {}
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    }
    let id = match last_insert_id(cx, conn).await {
        Outcome::Ok(id) => id,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };
    tracing::debug!(contact_id = id, "no match; created fresh primary");

    let snapshot = ContactSnapshot {
        id,
        email: row.email.clone(),
        phone: row.phone_number.clone(),
        linkage: cluster::Linkage::Primary,
        created_at: row.created_at,
    };
    res(cluster::project(&[snapshot], id).map_err(DbError::from))
}

fn snapshots_of(rows: &[ContactRow]) -> Result<Vec<ContactSnapshot>, DbError> {
    rows.iter()
        .map(|r| r.snapshot().map_err(DbError::from))
        .collect()
}
