//! FIFO ordering under the concurrency cap

mod common;

use std::time::Duration;

use claude_batch::domain::JobStatus;
use claude_batch::engine::{CreateOptions, Engine};
use tempfile::TempDir;

#[tokio::test]
async fn jobs_start_in_creation_order_under_cap() {
    let tmp = TempDir::new().expect("tempdir");
    let assistant = common::write_stub(tmp.path(), "claude", "echo run; sleep 0.3; exit 0");
    let mut config = common::test_config(&tmp.path().join("data"), &assistant);
    config.max_concurrent = 1;
    common::seed_repo(&config, "demo", false);

    let engine = Engine::new(config).expect("engine");
    engine.start().await.expect("start");

    let mut ids = Vec::new();
    for i in 0..4 {
        let (id, _) = engine
            .create(common::create_request(
                "demo",
                &format!("job number {}", i),
                CreateOptions::default(),
            ))
            .await
            .expect("create");
        ids.push(id);
        // Distinct created_at ordering.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for id in &ids {
        engine.start_job(*id).await.expect("start_job");
    }

    // While anything is in flight, at most one job occupies `running`.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let jobs: Vec<_> = ids.iter().map(|id| engine.get(*id).expect("get")).collect();
        let running = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count();
        assert!(running <= 1, "cap of 1 violated: {} running", running);
        if jobs.iter().all(|j| j.is_finished()) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs never finished");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Order of first-enters-running equals creation order.
    let started: Vec<_> = ids
        .iter()
        .map(|id| engine.get(*id).expect("get").started_at.expect("started"))
        .collect();
    for pair in started.windows(2) {
        assert!(pair[0] <= pair[1], "start order diverged from FIFO");
    }

    for id in &ids {
        let job = engine.get(*id).expect("get");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.exit_code, Some(0));
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn queue_positions_are_one_indexed_arrival_order() {
    let tmp = TempDir::new().expect("tempdir");
    let assistant = common::write_stub(tmp.path(), "claude", "sleep 2; exit 0");
    let mut config = common::test_config(&tmp.path().join("data"), &assistant);
    config.max_concurrent = 1;
    common::seed_repo(&config, "demo", false);

    let engine = Engine::new(config).expect("engine");
    engine.start().await.expect("start");

    // Occupy the single slot.
    let (busy, _) = engine
        .create(common::create_request("demo", "busy", CreateOptions::default()))
        .await
        .expect("create");
    engine.start_job(busy).await.expect("start_job");
    common::wait_status(&engine, busy, JobStatus::Running, Duration::from_secs(15)).await;

    let (first, _) = engine
        .create(common::create_request("demo", "first waiting", CreateOptions::default()))
        .await
        .expect("create");
    tokio::time::sleep(Duration::from_millis(10)).await;
    let (second, _) = engine
        .create(common::create_request("demo", "second waiting", CreateOptions::default()))
        .await
        .expect("create");

    engine.start_job(first).await.expect("start_job");
    engine.start_job(second).await.expect("start_job");

    let first_job = engine.get(first).expect("get");
    let second_job = engine.get(second).expect("get");
    if first_job.status == JobStatus::Queued && second_job.status == JobStatus::Queued {
        assert_eq!(first_job.queue_position, Some(1));
        assert_eq!(second_job.queue_position, Some(2));
    }

    common::wait_terminal(&engine, busy, Duration::from_secs(30)).await;
    common::wait_terminal(&engine, first, Duration::from_secs(30)).await;
    common::wait_terminal(&engine, second, Duration::from_secs(30)).await;

    engine.shutdown().await;
}
