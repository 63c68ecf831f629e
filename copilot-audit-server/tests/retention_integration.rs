mod common;

use chrono::{Duration as ChronoDuration, Local, Utc};
use copilot_audit_core::{PipelineMetrics, RetentionConfig};
use copilot_audit_server::subsystems::retention::RetentionSweeper;
use copilot_audit_server::{BatchSink, PgBatchWriter};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Persist a full record and backdate it by `age_days`.
async fn seed(pool: &PgPool, age_days: i32) -> Uuid {
    let record = common::full_record(Uuid::new_v4());
    let id = record.interaction_id;
    PgBatchWriter::new(pool.clone())
        .write_batch(&[record])
        .await
        .expect("seed batch should commit");

    sqlx::query("UPDATE interactions SET created_at = NOW() - make_interval(days => $2) WHERE interaction_id = $1")
        .bind(id)
        .bind(age_days)
        .execute(pool)
        .await
        .expect("Failed to backdate interaction");
    id
}

async fn rows_for(pool: &PgPool, id: Uuid) -> [i64; 4] {
    [
        common::count(pool, "interactions", id).await,
        common::count(pool, "thoughts", id).await,
        common::count(pool, "tool_calls", id).await,
        common::count(pool, "performance_metrics", id).await,
    ]
}

/// Same counts as `rows_for`, read on `conn` so they can be taken while it
/// holds a table lock.
async fn rows_in(conn: &mut PgConnection, id: Uuid) -> [i64; 4] {
    let mut counts = [0; 4];
    for (i, table) in ["interactions", "thoughts", "tool_calls", "performance_metrics"]
        .iter()
        .enumerate()
    {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE interaction_id = $1", table);
        counts[i] = sqlx::query_scalar::<_, i64>(&sql)
            .bind(id)
            .fetch_one(&mut *conn)
            .await
            .expect("count query failed");
    }
    counts
}

/// Pool for a sweeper under test, with extra connection settings.
async fn sweeper_pool(options: PgConnectOptions) -> PgPool {
    PgPoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .expect("Failed to connect sweeper pool")
}

fn base_options() -> PgConnectOptions {
    PgConnectOptions::from_str(&common::database_url()).expect("valid database url")
}

/// Local wall-clock time two seconds from now, as `HH:MM:SS`.
fn in_two_seconds() -> String {
    (Local::now() + ChronoDuration::seconds(2)).format("%H:%M:%S").to_string()
}

fn retention(days: u32, cleanup_time: String) -> RetentionConfig {
    RetentionConfig {
        days,
        auto_cleanup: true,
        cleanup_time,
    }
}

#[tokio::test]
async fn test_sweep_removes_only_expired_interactions() {
    let Some(pool) = common::connect().await else { return };
    let old = seed(&pool, 31).await;
    let recent = seed(&pool, 10).await;

    let sweeper = RetentionSweeper::new(
        pool.clone(),
        &retention(30, "03:00".into()),
        Arc::new(PipelineMetrics::new()),
    );
    let report = sweeper.sweep(Utc::now()).await.expect("sweep should succeed");

    // Other tests sweep the same tables concurrently, so only the seeded
    // rows are checked, not the report totals.
    assert!(report.cutoff.is_some());
    assert_eq!(rows_for(&pool, old).await, [0, 0, 0, 0]);
    assert_eq!(rows_for(&pool, recent).await, [1, 1, 2, 3]);
}

#[tokio::test]
async fn test_sweep_keeps_sessions() {
    let Some(pool) = common::connect().await else { return };
    let record = common::record(Uuid::new_v4());
    let session_id = record.session_id;
    PgBatchWriter::new(pool.clone()).write_batch(&[record.clone()]).await.unwrap();
    sqlx::query("UPDATE interactions SET created_at = NOW() - INTERVAL '60 days' WHERE interaction_id = $1")
        .bind(record.interaction_id)
        .execute(&pool)
        .await
        .unwrap();

    let sweeper = RetentionSweeper::new(
        pool.clone(),
        &retention(30, "03:00".into()),
        Arc::new(PipelineMetrics::new()),
    );
    sweeper.sweep(Utc::now()).await.unwrap();

    assert_eq!(common::count(&pool, "interactions", record.interaction_id).await, 0);
    assert_eq!(common::session_count(&pool, session_id).await, 1);
}

#[tokio::test]
async fn test_scheduled_sweep_fires_at_cleanup_time() {
    let Some(pool) = common::connect().await else { return };
    let old = seed(&pool, 31).await;
    let recent = seed(&pool, 10).await;

    let at = in_two_seconds();
    let metrics = Arc::new(PipelineMetrics::new());
    let sweeper = RetentionSweeper::new(pool.clone(), &retention(30, at), metrics.clone());

    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = tokio::spawn(sweeper.run(shutdown_tx.subscribe()));

    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    while metrics.sweeps_completed.get() == 0 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let _ = shutdown_tx.send(());
    handle.await.unwrap();

    assert_eq!(metrics.sweeps_completed.get(), 1);
    assert_eq!(rows_for(&pool, old).await, [0, 0, 0, 0]);
    assert_eq!(rows_for(&pool, recent).await, [1, 1, 2, 3]);
}

#[tokio::test]
async fn test_sweeper_stops_promptly_while_waiting() {
    let Some(pool) = common::connect().await else { return };
    let sweeper = RetentionSweeper::new(
        pool.clone(),
        &retention(30, "03:00".into()),
        Arc::new(PipelineMetrics::new()),
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = tokio::spawn(sweeper.run(shutdown_tx.subscribe()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = shutdown_tx.send(());

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("sweeper should exit on shutdown")
        .unwrap();
}

// The two tests below lock tool_calls from a second transaction. Their rows
// are 20 days old and swept with days = 15, so the 30-day sweeps running in
// parallel never touch them.

#[tokio::test]
async fn test_shutdown_abandons_in_flight_sweep() {
    let Some(pool) = common::connect().await else { return };
    let expired = seed(&pool, 20).await;

    const APP: &str = "copilot-audit-retention-abandon";
    let sweeper_pool = sweeper_pool(base_options().application_name(APP)).await;

    let mut lock = pool.begin().await.unwrap();
    sqlx::query("LOCK TABLE tool_calls IN ACCESS EXCLUSIVE MODE")
        .execute(&mut *lock)
        .await
        .unwrap();

    let metrics = Arc::new(PipelineMetrics::new());
    let sweeper = RetentionSweeper::new(
        sweeper_pool.clone(),
        &retention(15, in_two_seconds()),
        metrics.clone(),
    );
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = tokio::spawn(sweeper.run(shutdown_tx.subscribe()));

    // Wait until the sweep transaction is stuck behind the lock.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let mut blocked = 0i64;
    while blocked == 0 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        blocked = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pg_stat_activity WHERE application_name = $1 AND wait_event_type = 'Lock'",
        )
        .bind(APP)
        .fetch_one(&pool)
        .await
        .unwrap();
    }
    assert!(blocked > 0, "sweep never started");

    let _ = shutdown_tx.send(());
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("sweeper should exit while its sweep is blocked")
        .unwrap();

    assert_eq!(metrics.sweeps_completed.get(), 0);
    assert_eq!(metrics.sweeps_failed.get(), 0);
    assert_eq!(rows_in(&mut lock, expired).await, [1, 1, 2, 3]);

    lock.rollback().await.unwrap();
    sweeper_pool.close().await;

    // The abandoned transaction never commits.
    assert_eq!(rows_for(&pool, expired).await, [1, 1, 2, 3]);
}

#[tokio::test]
async fn test_failed_sweep_is_counted_and_rescheduled() {
    let Some(pool) = common::connect().await else { return };
    let expired = seed(&pool, 20).await;

    let sweeper_pool = sweeper_pool(base_options().options([("lock_timeout", "250ms")])).await;

    let mut lock = pool.begin().await.unwrap();
    sqlx::query("LOCK TABLE tool_calls IN ACCESS EXCLUSIVE MODE")
        .execute(&mut *lock)
        .await
        .unwrap();

    let metrics = Arc::new(PipelineMetrics::new());
    let sweeper = RetentionSweeper::new(
        sweeper_pool.clone(),
        &retention(15, in_two_seconds()),
        metrics.clone(),
    );
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = tokio::spawn(sweeper.run(shutdown_tx.subscribe()));

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while metrics.sweeps_failed.get() == 0 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(metrics.sweeps_failed.get(), 1);

    // Next attempt is tomorrow's slot, not an immediate retry.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(metrics.sweeps_failed.get(), 1);
    assert_eq!(metrics.sweeps_completed.get(), 0);
    assert!(!handle.is_finished());
    assert_eq!(rows_in(&mut lock, expired).await, [1, 1, 2, 3]);

    lock.rollback().await.unwrap();
    let _ = shutdown_tx.send(());
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("sweeper should exit on shutdown")
        .unwrap();
    sweeper_pool.close().await;
}
