//! Integration tests for the centralized database writer
//!
//! Every test starts its own executor, on an in-memory database unless it
//! needs a file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use encsync_cache::{CacheError, Cdb, CdbOptions, CdbRegistry, SqlValue};

// ============================================================================
// Test helpers
// ============================================================================

async fn setup() -> Arc<Cdb> {
    let cdb = Cdb::memory().await.expect("Failed to open in-memory database");
    cdb.connect()
        .execute("CREATE TABLE t (x INTEGER)", vec![])
        .await
        .unwrap();
    cdb
}

async fn count(conn: &encsync_cache::Connection) -> i64 {
    conn.fetch_one("SELECT COUNT(*) FROM t", vec![])
        .await
        .unwrap()
        .unwrap()
        .integer(0)
        .unwrap()
}

// ============================================================================
// Basic statements
// ============================================================================

#[tokio::test]
async fn test_execute_and_fetch() {
    let cdb = setup().await;
    let conn = cdb.connect();

    for x in 1..=5i64 {
        let result = conn
            .execute("INSERT INTO t VALUES (?1)", vec![x.into()])
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_id, x);
    }

    let rows = conn
        .fetch_all("SELECT x FROM t ORDER BY x", vec![])
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[4].integer(0).unwrap(), 5);

    let some = conn
        .fetch_many("SELECT x FROM t ORDER BY x", vec![], 2)
        .await
        .unwrap();
    assert_eq!(some.len(), 2);

    let none = conn
        .fetch_one("SELECT x FROM t WHERE x > ?1", vec![SqlValue::Integer(100)])
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_query_error_is_reported() {
    let cdb = setup().await;
    let conn = cdb.connect();

    let err = conn
        .execute("INSERT INTO missing VALUES (1)", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Query(_)));

    // The executor keeps serving after a failure.
    conn.execute("INSERT INTO t VALUES (1)", vec![]).await.unwrap();
    assert_eq!(count(&conn).await, 1);
}

#[tokio::test]
async fn test_fire_and_forget_preserves_order() {
    let cdb = setup().await;
    let conn = cdb.connect();

    for x in 0..20i64 {
        conn.execute_nowait("INSERT INTO t VALUES (?1)", vec![x.into()])
            .await
            .unwrap();
    }
    let rows = conn
        .fetch_all("SELECT x FROM t ORDER BY rowid", vec![])
        .await
        .unwrap();
    let values: Vec<i64> = rows.iter().map(|r| r.integer(0).unwrap()).collect();
    assert_eq!(values, (0..20).collect::<Vec<_>>());
}

// ============================================================================
// Isolation
// ============================================================================

#[tokio::test]
async fn test_other_connection_waits_for_transaction() {
    let cdb = setup().await;
    let c1 = cdb.connect();
    let c2 = cdb.connect();

    c1.begin().await.unwrap();
    assert!(c1.in_transaction());
    assert!(!c2.in_transaction());
    c1.execute("INSERT INTO t VALUES (1)", vec![]).await.unwrap();

    let reader = c2.clone();
    let handle = tokio::spawn(async move { count(&reader).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished(), "C2 ran inside C1's transaction");

    c1.execute("INSERT INTO t VALUES (2)", vec![]).await.unwrap();
    c1.commit().await.unwrap();

    assert_eq!(handle.await.unwrap(), 2);
}

#[tokio::test]
async fn test_rollback_discards_and_releases() {
    let cdb = setup().await;
    let c1 = cdb.connect();
    let c2 = cdb.connect();

    c1.begin().await.unwrap();
    c1.execute("INSERT INTO t VALUES (1)", vec![]).await.unwrap();
    c1.rollback().await.unwrap();

    assert!(!c1.in_transaction());
    assert_eq!(count(&c2).await, 0);
}

#[tokio::test]
async fn test_commit_without_transaction_is_noop() {
    let cdb = setup().await;
    let conn = cdb.connect();
    conn.commit().await.unwrap();
    conn.rollback().await.unwrap();
    assert!(!conn.seamless_commit().await.unwrap());
}

#[tokio::test]
async fn test_nested_begin_is_rejected() {
    let cdb = setup().await;
    let conn = cdb.connect();
    conn.begin().await.unwrap();
    assert!(matches!(
        conn.begin().await,
        Err(CacheError::Transaction(_))
    ));
    conn.rollback().await.unwrap();
}

#[tokio::test]
async fn test_seamless_commit_keeps_ownership() {
    let cdb = setup().await;
    let c1 = cdb.connect();
    let c2 = cdb.connect();

    c1.begin().await.unwrap();
    c1.execute("INSERT INTO t VALUES (1)", vec![]).await.unwrap();
    assert!(c1.seamless_commit().await.unwrap());
    assert!(c1.in_transaction());

    c1.execute("INSERT INTO t VALUES (2)", vec![]).await.unwrap();
    c1.rollback().await.unwrap();

    // Only the row committed by the seamless commit survives.
    assert_eq!(count(&c2).await, 1);
}

#[tokio::test]
async fn test_closing_owner_rolls_back() {
    let cdb = setup().await;
    let c1 = cdb.connect();
    let c2 = cdb.connect();

    c1.begin().await.unwrap();
    c1.execute("INSERT INTO t VALUES (1)", vec![]).await.unwrap();
    let clone = c1.clone();
    drop(c1);
    // A clone keeps the logical connection open.
    assert!(clone.in_transaction());
    drop(clone);

    assert_eq!(count(&c2).await, 0);
    assert!(!c2.in_transaction());
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test]
async fn test_backpressure_times_out_when_queue_is_full() {
    let options = CdbOptions {
        queue_limit: 2,
        busy_timeout: Duration::from_millis(200),
        ..CdbOptions::default()
    };
    let cdb = Cdb::open(Path::new(":memory:"), options).await.unwrap();
    let c1 = cdb.connect();
    let c2 = cdb.connect();
    c1.execute("CREATE TABLE t (x INTEGER)", vec![]).await.unwrap();

    c1.begin().await.unwrap();
    for x in 0..3i64 {
        c2.execute_nowait("INSERT INTO t VALUES (?1)", vec![x.into()])
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cdb.is_busy());
    assert_eq!(cdb.pending(), 3);

    let err = c2
        .execute_nowait("INSERT INTO t VALUES (9)", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Busy));

    // The owner is never held back.
    c1.execute("INSERT INTO t VALUES (100)", vec![]).await.unwrap();
    c1.commit().await.unwrap();

    assert_eq!(count(&c2).await, 4);
    assert!(!cdb.is_busy());
}

#[tokio::test]
async fn test_waiting_producer_resumes_after_drain() {
    let options = CdbOptions {
        queue_limit: 1,
        busy_timeout: Duration::from_secs(5),
        ..CdbOptions::default()
    };
    let cdb = Cdb::open(Path::new(":memory:"), options).await.unwrap();
    let c1 = cdb.connect();
    let c2 = cdb.connect();
    c1.execute("CREATE TABLE t (x INTEGER)", vec![]).await.unwrap();

    c1.begin().await.unwrap();
    c2.execute_nowait("INSERT INTO t VALUES (1)", vec![])
        .await
        .unwrap();
    c2.execute_nowait("INSERT INTO t VALUES (2)", vec![])
        .await
        .unwrap();

    let producer = c2.clone();
    let handle = tokio::spawn(async move {
        producer
            .execute("INSERT INTO t VALUES (3)", vec![])
            .await
            .map(|_| ())
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());

    c1.commit().await.unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(count(&c1).await, 3);
}

// ============================================================================
// Scoped acquisition
// ============================================================================

#[tokio::test]
async fn test_scope_is_reentrant_and_exclusive() {
    let cdb = setup().await;
    let c1 = cdb.connect();
    let c2 = cdb.connect();

    let outer = c1.scope().await;
    let inner = c1.scope().await;
    c1.execute("INSERT INTO t VALUES (1)", vec![]).await.unwrap();

    let other = c2.clone();
    let handle = tokio::spawn(async move {
        other
            .execute("INSERT INTO t VALUES (2)", vec![])
            .await
            .map(|_| ())
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished(), "C2 enqueued inside C1's scope");

    drop(inner);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished(), "inner guard released the scope");

    drop(outer);
    handle.await.unwrap().unwrap();
    assert_eq!(count(&c1).await, 2);
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_registry_shares_one_executor_per_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let registry = CdbRegistry::default();

    let c1 = registry.connect(&path).await.unwrap();
    let c2 = registry.connect(&path).await.unwrap();
    assert!(Arc::ptr_eq(c1.cdb(), c2.cdb()));
    assert_ne!(c1.id(), c2.id());
    assert_eq!(registry.open_count(), 1);

    c1.execute("CREATE TABLE t (x INTEGER)", vec![]).await.unwrap();
    c1.begin().await.unwrap();
    c1.execute("INSERT INTO t VALUES (1)", vec![]).await.unwrap();
    c1.commit().await.unwrap();
    drop(c1);
    drop(c2);

    // A new connection restarts the executor on the same file.
    let c3 = registry.connect(&path).await.unwrap();
    assert_eq!(count(&c3).await, 1);
}
