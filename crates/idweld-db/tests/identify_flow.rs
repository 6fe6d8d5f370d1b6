//! Integration tests for the identify pipeline against a real `SQLite` store.
//!
//! Covers the single-cluster paths: fresh primary creation, idempotent
//! re-identification, novelty-driven secondary creation, projection
//! ordering, tombstone visibility, and input validation. Merge behavior
//! lives in `merge_semantics.rs`.

use asupersync::runtime::RuntimeBuilder;
use asupersync::Cx;
use idweld_core::ConsolidatedContact;
use idweld_db::{
    ContactRow, DbPool, DbPoolConfig, count_contacts, get_contact, identify, tombstone_contact,
};
use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_suffix() -> u64 {
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn block_on<F, Fut, T>(f: F) -> T
where
    F: FnOnce(Cx) -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let cx = Cx::for_testing();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("build runtime");
    rt.block_on(f(cx))
}

fn make_pool() -> (DbPool, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("create tempdir");
    let db_path = dir
        .path()
        .join(format!("identify_flow_{}.db", unique_suffix()));
    let config = DbPoolConfig {
        database_url: format!("sqlite:///{}", db_path.display()),
        min_connections: 1,
        max_connections: 5,
        acquire_timeout_ms: 30_000,
        max_lifetime_ms: 3_600_000,
        run_migrations: true,
    };
    let pool = DbPool::new(&config).expect("create pool");
    (pool, dir)
}

fn run_identify(
    pool: &DbPool,
    email: Option<&str>,
    phone: Option<&str>,
) -> ConsolidatedContact {
    let pool = pool.clone();
    let email = email.map(str::to_string);
    let phone = phone.map(str::to_string);
    block_on(move |cx| async move {
        identify(&cx, &pool, email.as_deref(), phone.as_deref())
            .await
            .into_result()
            .expect("identify")
    })
}

fn contact_count(pool: &DbPool) -> i64 {
    let pool = pool.clone();
    block_on(move |cx| async move {
        count_contacts(&cx, &pool)
            .await
            .into_result()
            .expect("count contacts")
    })
}

fn contact(pool: &DbPool, id: i64) -> ContactRow {
    let pool = pool.clone();
    block_on(move |cx| async move {
        get_contact(&cx, &pool, id)
            .await
            .into_result()
            .expect("get contact")
    })
}

#[test]
fn no_match_creates_fresh_primary() {
    let (pool, _dir) = make_pool();

    let view = run_identify(&pool, Some("mcfly@hillvalley.edu"), Some("555-0001"));

    assert!(view.secondary_contact_ids.is_empty());
    assert_eq!(view.emails, vec!["mcfly@hillvalley.edu"]);
    assert_eq!(view.phone_numbers, vec!["555-0001"]);

    let row = contact(&pool, view.primary_contact_id);
    assert!(row.is_primary());
    assert!(row.linked_id.is_none());
    assert_eq!(contact_count(&pool), 1);
}

#[test]
fn exact_reidentify_is_idempotent() {
    let (pool, _dir) = make_pool();

    let first = run_identify(&pool, Some("doc@hillvalley.edu"), Some("555-0002"));
    let second = run_identify(&pool, Some("doc@hillvalley.edu"), Some("555-0002"));

    assert_eq!(first, second);
    assert_eq!(contact_count(&pool), 1);
}

#[test]
fn novelty_creates_exactly_one_secondary() {
    let (pool, _dir) = make_pool();

    let seed = run_identify(&pool, Some("biff@hillvalley.edu"), Some("555-0003"));
    let view = run_identify(&pool, Some("biff@hillvalley.edu"), Some("555-0099"));

    assert_eq!(view.primary_contact_id, seed.primary_contact_id);
    assert_eq!(view.secondary_contact_ids.len(), 1);
    // Primary's own phone leads the list.
    assert_eq!(view.phone_numbers, vec!["555-0003", "555-0099"]);
    assert_eq!(contact_count(&pool), 2);

    let secondary = contact(&pool, view.secondary_contact_ids[0]);
    assert!(!secondary.is_primary());
    assert_eq!(secondary.linked_id, Some(seed.primary_contact_id));
    assert_eq!(secondary.phone_number.as_deref(), Some("555-0099"));
}

#[test]
fn partial_match_is_a_pure_read() {
    let (pool, _dir) = make_pool();

    let seed = run_identify(&pool, Some("jen@hillvalley.edu"), Some("555-0004"));
    // Email-only and phone-only requests resolve the same cluster and
    // create nothing.
    let by_email = run_identify(&pool, Some("jen@hillvalley.edu"), None);
    let by_phone = run_identify(&pool, None, Some("555-0004"));

    assert_eq!(by_email, seed);
    assert_eq!(by_phone, seed);
    assert_eq!(contact_count(&pool), 1);
}

#[test]
fn projection_skips_duplicate_values() {
    let (pool, _dir) = make_pool();

    let seed = run_identify(&pool, Some("george@hillvalley.edu"), Some("555-0005"));
    // New email, same phone: one secondary sharing the phone value.
    let view = run_identify(&pool, Some("gmf@hillvalley.edu"), Some("555-0005"));

    assert_eq!(view.primary_contact_id, seed.primary_contact_id);
    assert_eq!(
        view.emails,
        vec!["george@hillvalley.edu", "gmf@hillvalley.edu"]
    );
    // The shared phone appears once.
    assert_eq!(view.phone_numbers, vec!["555-0005"]);
}

#[test]
fn blank_identifiers_are_rejected_before_storage() {
    let (pool, _dir) = make_pool();

    let outcome = {
        let pool = pool.clone();
        block_on(move |cx| async move { identify(&cx, &pool, Some("   "), Some("")).await })
    };
    let err = outcome.into_result().expect_err("blank input must fail");
    assert_eq!(err.error_code(), "INVALID_ARGUMENT");

    // Nothing was written — not even the schema matters here, but the
    // store must stay empty.
    assert_eq!(contact_count(&pool), 0);
}

#[test]
fn trimmed_input_matches_stored_values() {
    let (pool, _dir) = make_pool();

    let seed = run_identify(&pool, Some("needles@hillvalley.edu"), None);
    let view = run_identify(&pool, Some("  needles@hillvalley.edu  "), None);

    assert_eq!(view, seed);
    assert_eq!(contact_count(&pool), 1);
}

#[test]
fn tombstoned_rows_are_invisible() {
    let (pool, _dir) = make_pool();

    let seed = run_identify(&pool, Some("einstein@hillvalley.edu"), Some("555-0006"));
    {
        let pool = pool.clone();
        let id = seed.primary_contact_id;
        block_on(move |cx| async move {
            tombstone_contact(&cx, &pool, id)
                .await
                .into_result()
                .expect("tombstone")
        });
    }

    // The tombstoned row no longer matches, and it does not block creation
    // of a fresh primary for the same identifiers.
    let fresh = run_identify(&pool, Some("einstein@hillvalley.edu"), Some("555-0006"));
    assert_ne!(fresh.primary_contact_id, seed.primary_contact_id);
    assert!(fresh.secondary_contact_ids.is_empty());
    assert_eq!(contact_count(&pool), 1);
}

#[test]
fn email_only_contact_gains_phone_via_secondary() {
    let (pool, _dir) = make_pool();

    let seed = run_identify(&pool, Some("clara@hillvalley.edu"), None);
    assert!(seed.phone_numbers.is_empty());

    let view = run_identify(&pool, Some("clara@hillvalley.edu"), Some("555-0007"));
    assert_eq!(view.primary_contact_id, seed.primary_contact_id);
    assert_eq!(view.emails, vec!["clara@hillvalley.edu"]);
    assert_eq!(view.phone_numbers, vec!["555-0007"]);
    assert_eq!(view.secondary_contact_ids.len(), 1);
}
