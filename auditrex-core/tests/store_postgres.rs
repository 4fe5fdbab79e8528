//! Postgres-backed store behaviour.
//!
//! These tests need a real database and are ignored by default. Run them
//! serially against a scratch database:
//!
//! ```text
//! AUDITREX_TEST_DATABASE_URL=postgres://postgres:@localhost:5432/auditrex_test \
//!     cargo test -p auditrex-core --test store_postgres -- --ignored --test-threads=1
//! ```

mod support;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use auditrex_core::database::EventDb;
use auditrex_core::database::postgres::EventStore;
use auditrex_core::events::EventFilter;

use support::make_event;

async fn store() -> (EventStore, PgPool) {
    let url = std::env::var("AUDITREX_TEST_DATABASE_URL")
        .expect("AUDITREX_TEST_DATABASE_URL must point at a scratch database");
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("connecting to the test database");
    let store = EventStore::new(pool.clone());
    store.init().await.expect("schema init");
    (store, pool)
}

async fn reset(pool: &PgPool) {
    sqlx::raw_sql("TRUNCATE cf_audit_events, shipper_cursors")
        .execute(pool)
        .await
        .expect("truncating test tables");
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn init_is_idempotent() {
    let (store, _pool) = store().await;
    store.init().await.expect("second init");
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn round_trip_preserves_every_field() {
    let (store, pool) = store().await;
    reset(&pool).await;

    let mut event = make_event("round-trip", "2016-06-08T16:41:23Z");
    event.organization_guid = Some(Uuid::parse_str("c6c15847-44ee-45f2-8a76-e6b0b1af09a6").unwrap());
    event.space_guid = None;
    event.metadata = json!({"request": {"name": "some-app", "instances": 2}});

    store.store_audit_events(std::slice::from_ref(&event)).await.unwrap();

    let events = store
        .get_events(EventFilter {
            reverse: true,
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(events, vec![event]);
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn repeated_batches_do_not_duplicate_rows() {
    let (store, pool) = store().await;
    reset(&pool).await;

    let batch = vec![
        make_event("dup-a", "2016-06-08T16:41:21Z"),
        make_event("dup-b", "2016-06-08T16:41:22Z"),
    ];
    store.store_audit_events(&batch).await.unwrap();
    store.store_audit_events(&batch).await.unwrap();

    let overlapping = vec![
        make_event("dup-b", "2016-06-08T16:41:22Z"),
        make_event("dup-c", "2016-06-08T16:41:23Z"),
    ];
    store.store_audit_events(&overlapping).await.unwrap();

    let events = store.get_events(EventFilter::default()).await.unwrap();
    assert_eq!(events.len(), 3);

    // Empty batches are a no-op success.
    store.store_audit_events(&[]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn latest_event_time_is_epoch_when_empty_and_max_otherwise() {
    let (store, pool) = store().await;
    reset(&pool).await;

    assert_eq!(
        store.get_latest_event_time().await.unwrap(),
        DateTime::UNIX_EPOCH
    );

    store
        .store_audit_events(&[
            make_event("early", "2016-06-08T16:41:21Z"),
            make_event("late", "2016-06-08T17:00:00Z"),
            make_event("middle", "2016-06-08T16:50:00Z"),
        ])
        .await
        .unwrap();

    assert_eq!(
        store.get_latest_event_time().await.unwrap(),
        "2016-06-08T17:00:00Z".parse::<DateTime<Utc>>().unwrap()
    );
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn unshipped_query_honours_the_cursor_boundary() {
    let (store, pool) = store().await;
    reset(&pool).await;

    store
        .store_audit_events(&[
            make_event("a", "2016-06-08T16:41:05Z"),
            make_event("b", "2016-06-08T16:41:05Z"),
            make_event("c", "2016-06-08T16:41:06Z"),
        ])
        .await
        .unwrap();

    // No cursor: everything, ascending by created_at.
    let all = store
        .get_unshipped_events_for_shipper("splunk-test")
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));

    // Cursor on b: its same-second neighbour a is re-sent, b itself is not.
    store
        .update_shipper_cursor(
            "splunk-test",
            "2016-06-08T16:41:05Z".parse().unwrap(),
            "b",
        )
        .await
        .unwrap();
    let after_b = store
        .get_unshipped_events_for_shipper("splunk-test")
        .await
        .unwrap();
    let guids: Vec<&str> = after_b.iter().map(|e| e.guid.as_str()).collect();
    assert_eq!(guids, ["a", "c"]);

    // Cursor on c: nothing is left.
    store
        .update_shipper_cursor(
            "splunk-test",
            "2016-06-08T16:41:06Z".parse().unwrap(),
            "c",
        )
        .await
        .unwrap();
    assert!(store
        .get_unshipped_events_for_shipper("splunk-test")
        .await
        .unwrap()
        .is_empty());

    // Another shipper's cursor is untouched.
    let other = store
        .get_unshipped_events_for_shipper("other-shipper")
        .await
        .unwrap();
    assert_eq!(other.len(), 3);
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn cursor_upsert_keeps_one_row_per_name() {
    let (store, pool) = store().await;
    reset(&pool).await;

    store
        .update_shipper_cursor("cursor-test", "2016-06-08T16:41:05Z".parse().unwrap(), "x")
        .await
        .unwrap();
    store
        .update_shipper_cursor("cursor-test", "2016-06-08T16:41:09Z".parse().unwrap(), "y")
        .await
        .unwrap();

    let cursor = store
        .get_shipper_cursor("cursor-test")
        .await
        .unwrap()
        .expect("cursor exists");
    assert_eq!(cursor.shipped_id, "y");
    assert_eq!(
        cursor.updated_at,
        "2016-06-08T16:41:09Z".parse::<DateTime<Utc>>().unwrap()
    );

    let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM shipper_cursors")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn get_events_respects_direction_and_limit() {
    let (store, pool) = store().await;
    reset(&pool).await;

    store
        .store_audit_events(&[
            make_event("first", "2016-06-08T16:41:21Z"),
            make_event("second", "2016-06-08T16:41:22Z"),
            make_event("third", "2016-06-08T16:41:23Z"),
        ])
        .await
        .unwrap();

    let ascending = store
        .get_events(EventFilter {
            reverse: true,
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(ascending[0].guid, "first");
    assert_eq!(ascending[2].guid, "third");

    let newest = store
        .get_events(EventFilter {
            reverse: false,
            limit: Some(1),
        })
        .await
        .unwrap();
    assert_eq!(newest.len(), 1);
    assert_eq!(newest[0].guid, "third");
}

#[tokio::test]
#[ignore = "requires a postgres database"]
async fn event_count_estimate_is_available() {
    let (store, _pool) = store().await;
    let count = store.get_event_count().await.unwrap();
    assert!(count >= 0);
}
