use std::sync::Arc;
use std::time::Duration;

use docflat::store::memory::MemoryStore;
use docflat::store::StoreError;
use docflat::sync::{SyncError, SyncOptions};
use docflat::value::{Map, Value};
use rstest::rstest;
use tokio_util::sync::CancellationToken;

use crate::fixtures::*;
use crate::{discover_tables, run_sync, run_sync_with_tables, run_sync_with_token};

#[rstest]
#[tokio::test]
async fn test_undiscovered_nested_table(orders_store: Arc<MemoryStore>) {
    // Discovered without nested tables, synced with them
    let tables = discover_tables(orders_store.clone(), &SyncOptions::default()).await;
    let options = SyncOptions {
        include_nested_tables: true,
        flatten_nested_tables: true,
        ..Default::default()
    };

    let run = run_sync_with_tables(
        orders_store,
        options,
        tables,
        CancellationToken::new(),
    )
    .await;

    let err = run.result.as_ref().unwrap_err();
    assert!(
        matches!(err, SyncError::TableNotFound { name } if name == "users_orders"),
        "Unexpected error: {err}"
    );
    assert!(run.resources.iter().all(|r| r.table_name() != "users_orders"));
    assert_eq!(run.ctx.table_metrics("users").unwrap().errors(), 1);
}

#[rstest]
#[tokio::test]
async fn test_failing_query_aborts_run(orders_store: Arc<MemoryStore>) {
    orders_store.fail_queries("users", "permission denied");

    let run = run_sync(orders_store, SyncOptions::default()).await;

    let err = run.result.as_ref().unwrap_err();
    assert!(
        matches!(err, SyncError::Store(StoreError::Query { collection, .. }) if collection == "users"),
        "Unexpected error: {err}"
    );
    assert_eq!(
        err.to_string(),
        "Query on collection \"users\" failed: permission denied"
    );
    assert!(run.table("users").is_empty());
    assert_eq!(run.ctx.table_metrics("users").unwrap().errors(), 1);
}

#[tokio::test]
async fn test_failing_later_page_stops_nested_reads() {
    let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(50)));
    for i in 0..8 {
        let user = format!("u{i}");
        store.insert("users", &user, Map::new());
        store.insert(&format!("users/{user}/orders"), "o1", Map::new());
    }
    let options = SyncOptions {
        include_nested_tables: true,
        flatten_nested_tables: true,
        batch_size: 4,
        ..Default::default()
    };
    let tables = discover_tables(store.clone(), &options).await;
    // The first page is read, the second one fails while its users read their orders
    store.fail_queries_after("users", 1, "unavailable");

    let run = run_sync_with_tables(store, options, tables, CancellationToken::new()).await;

    let err = run.result.as_ref().unwrap_err();
    assert!(
        matches!(err, SyncError::Store(StoreError::Query { reason, .. }) if reason == "unavailable"),
        "Unexpected error: {err}"
    );
    assert!(run.resources.is_empty());
    assert_eq!(run.ctx.metrics().total_resources(), 0);
}

#[tokio::test]
async fn test_failing_table_stops_sibling_tables() {
    let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(20)));
    for i in 0..50 {
        store.insert("items", &item_id(i), fields(&[("rank", Value::from(i as i64))]));
    }
    store.insert("users", "1", Map::new());
    store.fail_queries("users", "permission denied");
    let options = SyncOptions {
        batch_size: 1,
        ..Default::default()
    };

    let run = run_sync(store.clone(), options).await;

    let err = run.result.as_ref().unwrap_err();
    assert!(
        matches!(err, SyncError::Store(StoreError::Query { collection, .. }) if collection == "users"),
        "Unexpected error: {err}"
    );
    // Paging through items stops shortly after users fails
    assert!(run.ids("items").len() < 10);
    assert!(store.query_count("items") < 10);
    assert_eq!(run.ctx.table_metrics("items").unwrap().errors(), 0);
}

#[tokio::test]
async fn test_nested_table_derived_from_another_parent() {
    let store = Arc::new(MemoryStore::new());
    store.insert("a", "1", Map::new());
    store.insert("a/1/b_c", "x", Map::new());
    store.insert("a_b", "2", Map::new());
    store.insert("a_b/2/c", "y", Map::new());
    let options = SyncOptions {
        include_nested_tables: true,
        flatten_nested_tables: true,
        ..Default::default()
    };
    let tables = discover_tables(store.clone(), &options).await;
    assert_eq!(tables.get("a_b_c").unwrap().parent.as_deref(), Some("a"));

    let run = run_sync_with_tables(store, options, tables, CancellationToken::new()).await;

    let err = run.result.as_ref().unwrap_err();
    assert!(
        matches!(err, SyncError::TableNotFound { name } if name == "a_b_c"),
        "Unexpected error: {err}"
    );
    // Nothing from a_b/2/c is written into the table owned by a
    assert!(run.resources.iter().all(|r| r.id() != Some("y")));
}

#[rstest]
#[tokio::test]
async fn test_failing_nested_query(orders_store: Arc<MemoryStore>) {
    orders_store.fail_queries("users/42/orders", "unavailable");
    let options = SyncOptions {
        include_nested_tables: true,
        flatten_nested_tables: true,
        ..Default::default()
    };

    let run = run_sync(orders_store, options).await;

    assert!(matches!(
        run.result,
        Err(SyncError::Store(StoreError::Query { .. }))
    ));
    assert!(run.table("users_orders").is_empty());
}

#[rstest]
#[tokio::test]
async fn test_cancelled_before_start(users_store: Arc<MemoryStore>) {
    let token = CancellationToken::new();
    token.cancel();

    let run = run_sync_with_token(users_store.clone(), SyncOptions::default(), token).await;

    assert!(matches!(run.result, Err(SyncError::Cancelled)));
    assert!(run.resources.is_empty());
    assert_eq!(users_store.query_count("users"), 0);
    assert_eq!(run.ctx.metrics().total_resources(), 0);
    // Cancellation is not a table failure
    assert_eq!(run.ctx.table_metrics("users").unwrap().errors(), 0);
}

#[rstest]
#[case::zero_batch_size(SyncOptions { batch_size: 0, ..Default::default() })]
#[case::zero_concurrency(SyncOptions { document_concurrency: 0, ..Default::default() })]
#[case::empty_order_by(SyncOptions { order_by: Some(String::new()), ..Default::default() })]
#[tokio::test]
async fn test_invalid_options(#[case] options: SyncOptions) {
    let store = numbered_store(3);

    let run = run_sync(store.clone(), options).await;

    assert!(matches!(run.result, Err(SyncError::InvalidOptions { .. })));
    assert!(run.resources.is_empty());
    assert_eq!(store.query_count("items"), 0);
}
