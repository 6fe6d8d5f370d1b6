//! Integration tests for cluster collisions: demotion, re-parenting, and
//! merge determinism against a real `SQLite` store.

use asupersync::runtime::RuntimeBuilder;
use asupersync::Cx;
use idweld_core::ConsolidatedContact;
use idweld_db::{ContactRow, DbPool, DbPoolConfig, count_contacts, get_contact, identify};
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
        .join(format!("merge_semantics_{}.db", unique_suffix()));
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
fn merge_picks_oldest_primary() {
    let (pool, _dir) = make_pool();

    let a = run_identify(&pool, Some("lorraine@hillvalley.edu"), Some("555-0100"));
    let b = run_identify(&pool, Some("baines@hillvalley.edu"), Some("555-0200"));
    assert_ne!(a.primary_contact_id, b.primary_contact_id);

    // Bridge the two clusters: A's email with B's phone.
    let merged = run_identify(&pool, Some("lorraine@hillvalley.edu"), Some("555-0200"));

    assert_eq!(merged.primary_contact_id, a.primary_contact_id);
    assert_eq!(
        merged.secondary_contact_ids,
        vec![b.primary_contact_id]
    );
    assert_eq!(
        merged.emails,
        vec!["lorraine@hillvalley.edu", "baines@hillvalley.edu"]
    );
    assert_eq!(merged.phone_numbers, vec!["555-0100", "555-0200"]);

    // B was demoted in place: precedence flipped, link set, identifiers
    // untouched.
    let demoted = contact(&pool, b.primary_contact_id);
    assert!(!demoted.is_primary());
    assert_eq!(demoted.linked_id, Some(a.primary_contact_id));
    assert_eq!(demoted.email.as_deref(), Some("baines@hillvalley.edu"));

    // The bridge request itself carried no novel identifier, so no row was
    // created.
    assert_eq!(contact_count(&pool), 2);
}

#[test]
fn merge_reparents_transitively() {
    let (pool, _dir) = make_pool();

    let a = run_identify(&pool, Some("strickland@hillvalley.edu"), Some("555-0300"));
    let b = run_identify(&pool, Some("tannen@hillvalley.edu"), Some("555-0400"));
    // C: a secondary of B carrying a novel phone.
    let with_c = run_identify(&pool, Some("tannen@hillvalley.edu"), Some("555-0401"));
    let c_id = with_c.secondary_contact_ids[0];

    // Bridge A and B's clusters.
    let merged = run_identify(&pool, Some("strickland@hillvalley.edu"), Some("555-0400"));

    assert_eq!(merged.primary_contact_id, a.primary_contact_id);
    // C now points at the true primary, not at its demoted former owner.
    let c = contact(&pool, c_id);
    assert_eq!(c.linked_id, Some(a.primary_contact_id));
    assert!(merged.secondary_contact_ids.contains(&c_id));
    assert!(merged
        .secondary_contact_ids
        .contains(&b.primary_contact_id));
    assert_eq!(merged.secondary_contact_ids.len(), 2);
}

#[test]
fn merge_is_idempotent_under_reapplication() {
    let (pool, _dir) = make_pool();

    run_identify(&pool, Some("marty@hillvalley.edu"), Some("555-0500"));
    run_identify(&pool, Some("calvin@hillvalley.edu"), Some("555-0600"));

    let first = run_identify(&pool, Some("marty@hillvalley.edu"), Some("555-0600"));
    let second = run_identify(&pool, Some("marty@hillvalley.edu"), Some("555-0600"));

    assert_eq!(first, second);
    assert_eq!(contact_count(&pool), 2);
}

#[test]
fn merge_outcome_is_order_insensitive() {
    // Three clusters A, B, C (A oldest). Bridging A–B then B–C must land
    // in the same place as bridging B–C then A–B: everything under A.
    let bridge_orders: [[(Option<&str>, Option<&str>); 2]; 2] = [
        [
            (Some("a@ord.test"), Some("20")),
            (Some("b@ord.test"), Some("30")),
        ],
        [
            (Some("b@ord.test"), Some("30")),
            (Some("a@ord.test"), Some("20")),
        ],
    ];

    let mut outcomes: Vec<(Vec<String>, usize)> = Vec::new();
    for bridges in bridge_orders {
        let (pool, _dir) = make_pool();
        let a = run_identify(&pool, Some("a@ord.test"), Some("10"));
        run_identify(&pool, Some("b@ord.test"), Some("20"));
        run_identify(&pool, Some("c@ord.test"), Some("30"));

        for (email, phone) in bridges {
            run_identify(&pool, email, phone);
        }

        let final_view = run_identify(&pool, Some("a@ord.test"), None);
        assert_eq!(final_view.primary_contact_id, a.primary_contact_id);
        assert_eq!(contact_count(&pool), 3);

        let mut emails = final_view.emails.clone();
        emails.sort();
        outcomes.push((emails, final_view.secondary_contact_ids.len()));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].1, 2);
}

#[test]
fn updated_at_bumped_on_demotion_created_at_untouched() {
    let (pool, _dir) = make_pool();

    let a = run_identify(&pool, Some("goldie@hillvalley.edu"), Some("555-0700"));
    let b = run_identify(&pool, Some("wilson@hillvalley.edu"), Some("555-0800"));
    let before = contact(&pool, b.primary_contact_id);

    run_identify(&pool, Some("goldie@hillvalley.edu"), Some("555-0800"));
    let after = contact(&pool, b.primary_contact_id);

    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at >= before.updated_at);
    assert_eq!(after.linked_id, Some(a.primary_contact_id));
}
