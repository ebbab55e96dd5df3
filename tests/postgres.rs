//! Runs against a real database when `DATABASE_URL` is set; otherwise every
//! test returns immediately.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::{json, Value};
use tablequeue::{
    sweep, JobSpec, JobStatus, JobStore, PgJobStore, ProcessOptions, QueueClient, QueueConfig,
    RecoveryMode,
};
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

async fn fresh_queue(table: &str) -> Option<QueueClient<PgJobStore>> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let config = QueueConfig::new("pg_tests")
        .database_url(url)
        .table(table)
        .extra_fields(["user_id"])
        .polling_rates(Duration::from_millis(5), Duration::from_millis(50))
        .recovery_interval(Duration::from_millis(100));
    let queue = QueueClient::connect(config).await.unwrap();
    queue.drop_table().await.unwrap();
    queue.create_table().await.unwrap();
    Some(queue)
}

async fn wait_until_finished(queue: &QueueClient<PgJobStore>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let rows = queue.select_all().await.unwrap();
        if !rows.is_empty() && rows.iter().all(|row| row.status.is_terminal()) {
            return;
        }
        assert!(Instant::now() < deadline, "gave up waiting, rows: {rows:#?}");
        sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn upsert_merges_duplicates_and_mirrors_fields() {
    let Some(queue) = fresh_queue("tq_pg_upsert").await else {
        return;
    };

    queue
        .add_jobs([
            JobSpec::new(json!({"user_id": "u-1", "n": 1}))
                .unique_key("u-1")
                .priority(10),
            JobSpec::new(json!({"user_id": 2, "n": 2})),
        ])
        .await
        .unwrap();
    queue
        .add_job(JobSpec::new(json!({"n": 3})).unique_key("u-1").priority(4))
        .await
        .unwrap();

    let rows = queue.select_all().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].priority, Some(4));
    assert_eq!(rows[0].body_json().unwrap().unwrap()["n"], json!(1));
    assert_eq!(rows[0].extra["user_id"].as_deref(), Some("u-1"));
    assert_eq!(rows[1].extra["user_id"].as_deref(), Some("2"));
    assert!(rows.iter().all(|row| row.status == JobStatus::Waiting));

    queue.drop_table().await.unwrap();
}

#[tokio::test]
async fn reserve_takes_at_most_its_limit() {
    let Some(queue) = fresh_queue("tq_pg_limit").await else {
        return;
    };
    let store = queue.store();
    queue.add_jobs((0..20).map(|i| json!(i))).await.unwrap();

    assert_eq!(store.reserve_batch("pg_tests", 42, 3).await.unwrap(), 3);
    let batch = store.fetch_batch(42, 10).await.unwrap();
    assert_eq!(batch.iter().map(|job| job.id).collect::<Vec<_>>(), vec![1, 2, 3]);

    let rows = queue.select_all().await.unwrap();
    let processing = rows
        .iter()
        .filter(|row| row.status == JobStatus::Processing)
        .count();
    assert_eq!(processing, 3);

    queue.drop_table().await.unwrap();
}

#[tokio::test]
async fn quoted_field_names_round_trip() {
    let Some(url) = std::env::var("DATABASE_URL").ok() else {
        return;
    };
    let config = QueueConfig::new("pg_tests")
        .database_url(url)
        .table("tq_pg_Fields")
        .extra_fields(["userId", "user", "order"]);
    let queue = QueueClient::connect(config).await.unwrap();
    queue.drop_table().await.unwrap();
    queue.create_table().await.unwrap();

    queue
        .add_job(json!({"userId": "u-9", "user": "ada", "order": 3}))
        .await
        .unwrap();

    let rows = queue.select_all().await.unwrap();
    assert_eq!(rows[0].extra["userId"].as_deref(), Some("u-9"));
    assert_eq!(rows[0].extra["user"].as_deref(), Some("ada"));
    assert_eq!(rows[0].extra["order"].as_deref(), Some("3"));

    queue.drop_table().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_are_disjoint() {
    let Some(queue) = fresh_queue("tq_pg_claims").await else {
        return;
    };
    queue.add_jobs((0..300).map(|i| json!(i))).await.unwrap();

    let mut claimers = Vec::new();
    for worker in 0..6_i64 {
        let store = queue.store().clone();
        claimers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            for round in 0.. {
                let batch_id = worker * 1_000_000 + round + 1;
                if store.reserve_batch("pg_tests", batch_id, 10).await.unwrap() == 0 {
                    break;
                }
                let batch = store.fetch_batch(batch_id, 10).await.unwrap();
                claimed.extend(batch.into_iter().map(|job| job.id));
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for claimer in claimers {
        for id in claimer.await.unwrap() {
            assert!(seen.insert(id), "job {id} was claimed twice");
        }
    }
    assert_eq!(seen.len(), 300);

    queue.drop_table().await.unwrap();
}

#[tokio::test]
async fn processes_in_priority_order_and_records_outcomes() {
    let Some(queue) = fresh_queue("tq_pg_process").await else {
        return;
    };
    for priority in [2, 0, 1] {
        queue
            .add_job(JobSpec::new(priority).priority(priority))
            .await
            .unwrap();
    }

    queue
        .process(
            |body: Value| async move {
                if body == json!(1) {
                    anyhow::bail!("odd one out");
                }
                Ok(json!({"doubled": body.as_i64().unwrap_or_default() * 2}))
            },
            ProcessOptions::default().concurrency(1),
        )
        .unwrap();
    wait_until_finished(&queue).await;
    queue.stop_processing();

    let rows = queue.select_all().await.unwrap();
    let by_body = |n: i64| {
        rows.iter()
            .find(|row| row.body.as_deref() == Some(n.to_string().as_str()))
            .unwrap()
    };
    assert_eq!(by_body(0).status, JobStatus::Success);
    assert_eq!(by_body(0).result.as_deref(), Some(r#"{"doubled":0}"#));
    assert_eq!(by_body(1).status, JobStatus::Error);
    assert_eq!(by_body(1).result.as_deref(), Some("odd one out"));
    assert_eq!(by_body(2).result.as_deref(), Some(r#"{"doubled":4}"#));
    assert!(by_body(0).started_ts.unwrap() <= by_body(1).started_ts.unwrap());
    assert!(by_body(1).started_ts.unwrap() <= by_body(2).started_ts.unwrap());

    queue.drop_table().await.unwrap();
}

#[tokio::test]
async fn sweeps_requeue_or_mark_stale_claims() {
    let Some(queue) = fresh_queue("tq_pg_sweep").await else {
        return;
    };
    let store = queue.store();
    queue
        .add_jobs([JobSpec::new(1).unique_key("a"), JobSpec::new(2).unique_key("b")])
        .await
        .unwrap();
    assert_eq!(store.reserve_batch("pg_tests", 99, 1).await.unwrap(), 1);

    sleep(Duration::from_millis(300)).await;
    let requeued = sweep(store, "pg_tests", RecoveryMode::Recover, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(requeued, 1);

    assert_eq!(store.reserve_batch("pg_tests", 100, 2).await.unwrap(), 2);
    // The stale claim token no longer owns the row.
    assert!(!store.complete_job(1, 99, "null").await.unwrap());

    sleep(Duration::from_millis(300)).await;
    let marked = sweep(store, "pg_tests", RecoveryMode::MarkStuck, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(marked, 2);

    let rows = queue.select_all().await.unwrap();
    assert!(rows.iter().all(|row| row.status == JobStatus::Stuck));
    assert!(rows.iter().all(|row| row.recovered && row.unique_key.is_none()));

    queue.drop_table().await.unwrap();
}
