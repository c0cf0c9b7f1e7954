//! End-to-end engine lifecycle: create, start, run, observe, delete

mod common;

use std::time::Duration;

use claude_batch::domain::{Job, JobStatus};
use claude_batch::engine::{CreateOptions, Engine};
use claude_batch::error::EngineError;
use claude_batch::process::registry;
use claude_batch::workspace::UploadedFile;
use tempfile::TempDir;
use uuid::Uuid;

#[tokio::test]
async fn happy_path_runs_to_completion() {
    let tmp = TempDir::new().expect("tempdir");
    let assistant = common::write_stub(
        tmp.path(),
        "claude",
        "echo listing files; ls; exit 0",
    );
    let config = common::test_config(&tmp.path().join("data"), &assistant);
    common::seed_repo(&config, "demo", false);

    let engine = Engine::new(config).expect("engine");
    engine.start().await.expect("start");

    let (id, status) = engine
        .create(common::create_request(
            "demo",
            "List top-level files.",
            CreateOptions {
                timeout_seconds: Some(60),
                ..Default::default()
            },
        ))
        .await
        .expect("create");
    assert_eq!(status, JobStatus::Created);

    let position = engine.start_job(id).await.expect("start_job");
    assert!(position >= 1);

    let job = common::wait_status(&engine, id, JobStatus::Completed, Duration::from_secs(20)).await;
    assert_eq!(job.exit_code, Some(0));
    assert!(!job.output.is_empty());
    assert!(job.output.contains("listing files"));
    assert!(job.workspace_path.is_dir());
    assert!(job.workspace_path.join("README.md").exists());
    // No process registration survives the job.
    assert!(registry::get(id).is_none());

    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert!(job.created_at <= job.started_at.unwrap());
    assert!(job.started_at.unwrap() <= job.completed_at.unwrap());

    engine.shutdown().await;
}

#[tokio::test]
async fn observed_status_is_always_durable() {
    let tmp = TempDir::new().expect("tempdir");
    let assistant = common::write_stub(tmp.path(), "claude", "echo working; sleep 0.4; exit 0");
    let config = common::test_config(&tmp.path().join("data"), &assistant);
    common::seed_repo(&config, "demo", false);

    let engine = Engine::new(config).expect("engine");
    engine.start().await.expect("start");

    let (id, _) = engine
        .create(common::create_request("demo", "work", CreateOptions::default()))
        .await
        .expect("create");
    engine.start_job(id).await.expect("start_job");

    // At every observation point the on-disk record carries the same status.
    let record_path = engine.store().record_path(id);
    loop {
        let observed = engine.get(id).expect("get");
        let on_disk: Job =
            serde_json::from_str(&std::fs::read_to_string(&record_path).expect("read"))
                .expect("parse");
        assert_eq!(observed.status, on_disk.status);
        if observed.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn create_validates_before_touching_state() {
    let tmp = TempDir::new().expect("tempdir");
    let assistant = common::write_stub(tmp.path(), "claude", "exit 0");
    let config = common::test_config(&tmp.path().join("data"), &assistant);
    let jobs_dir = config.jobs_dir();
    common::seed_repo(&config, "demo", false);

    let engine = Engine::new(config).expect("engine");
    engine.start().await.expect("start");

    // Hostile repo name: validation error, nothing persisted.
    let err = engine
        .create(common::create_request(
            "evil; rm -rf /",
            "x",
            CreateOptions::default(),
        ))
        .await
        .expect_err("must reject");
    assert!(matches!(err, EngineError::Validation(_)));

    // Unknown repo.
    let err = engine
        .create(common::create_request("ghost", "x", CreateOptions::default()))
        .await
        .expect_err("must not find");
    assert!(matches!(err, EngineError::NotFound(_)));

    // Bad env key.
    let mut options = CreateOptions::default();
    options.env.insert("BAD KEY".to_string(), "v".to_string());
    let err = engine
        .create(common::create_request("demo", "x", options))
        .await
        .expect_err("must reject env");
    assert!(matches!(err, EngineError::Validation(_)));

    // Upload paths must stay inside the workspace.
    for name in ["../../etc/passwd", "/etc/passwd", "a;b.txt"] {
        let mut request = common::create_request("demo", "x", CreateOptions::default());
        request.uploaded_files.push(UploadedFile {
            name: name.to_string(),
            contents: b"x".to_vec(),
        });
        let err = engine.create(request).await.expect_err("must reject upload");
        assert!(
            matches!(err, EngineError::Validation(_)),
            "upload path {:?} must be rejected",
            name
        );
    }

    let records = std::fs::read_dir(&jobs_dir)
        .expect("read_dir")
        .filter(|e| {
            e.as_ref()
                .map(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
                .unwrap_or(false)
        })
        .count();
    assert_eq!(records, 0, "validation failures must not persist records");

    engine.shutdown().await;
}

#[tokio::test]
async fn unknown_job_operations_return_not_found() {
    let tmp = TempDir::new().expect("tempdir");
    let assistant = common::write_stub(tmp.path(), "claude", "exit 0");
    let config = common::test_config(&tmp.path().join("data"), &assistant);

    let engine = Engine::new(config).expect("engine");
    engine.start().await.expect("start");

    let ghost = Uuid::new_v4();
    assert!(matches!(engine.get(ghost), Err(EngineError::NotFound(_))));
    assert!(matches!(
        engine.start_job(ghost).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.cancel(ghost).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.delete(ghost).await,
        Err(EngineError::NotFound(_))
    ));

    engine.shutdown().await;
}

#[tokio::test]
async fn delete_removes_record_and_job_dir() {
    let tmp = TempDir::new().expect("tempdir");
    let assistant = common::write_stub(tmp.path(), "claude", "echo done; exit 0");
    let config = common::test_config(&tmp.path().join("data"), &assistant);
    common::seed_repo(&config, "demo", false);

    let engine = Engine::new(config).expect("engine");
    engine.start().await.expect("start");

    let (id, _) = engine
        .create(common::create_request("demo", "run", CreateOptions::default()))
        .await
        .expect("create");
    engine.start_job(id).await.expect("start_job");
    common::wait_terminal(&engine, id, Duration::from_secs(20)).await;

    let job_dir = engine.store().job_dir(id);
    assert!(job_dir.exists());

    let outcome = engine.delete(id).await.expect("delete");
    assert!(!outcome.terminated, "job already finished");
    assert!(outcome.workspace_removed);
    assert!(!job_dir.exists());
    assert!(matches!(engine.get(id), Err(EngineError::NotFound(_))));

    engine.shutdown().await;
}

#[tokio::test]
async fn list_is_per_user_and_newest_first() {
    let tmp = TempDir::new().expect("tempdir");
    let assistant = common::write_stub(tmp.path(), "claude", "exit 0");
    let config = common::test_config(&tmp.path().join("data"), &assistant);
    common::seed_repo(&config, "demo", false);

    let engine = Engine::new(config).expect("engine");
    engine.start().await.expect("start");

    let (first, _) = engine
        .create(common::create_request("demo", "first", CreateOptions::default()))
        .await
        .expect("create");
    let (second, _) = engine
        .create(common::create_request("demo", "second", CreateOptions::default()))
        .await
        .expect("create");

    let me = common::current_user().username;
    let mine = engine.list(Some(&me));
    assert_eq!(mine.len(), 2);
    assert_eq!(mine[0].id, second, "newest first");
    assert_eq!(mine[1].id, first);

    assert!(engine.list(Some("someone-else")).is_empty());

    engine.shutdown().await;
}
