//! End-to-end orchestrator behavior: submission, timeouts, rate limiting,
//! log streaming, and recovery of lost jobs.


use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use ephemeral_orchestrator::config::OrchestratorConfig;
use ephemeral_orchestrator::error::{OrchestratorError, QueueError};
use ephemeral_orchestrator::scheduler::{Job, JobStatus, JobStore, Priority, Target};
use ephemeral_orchestrator::worker::ExitOutcome;
use ephemeral_orchestrator::JobRequest;
use test_harness::{test_config, Script, ScriptedProvider, TestOrchestrator};

#[tokio::test]
async fn test_hanging_agent_times_out() {
    let provider = ScriptedProvider::new(Script::Hang { honor_stop: true });
    let harness = TestOrchestrator::start(test_config(), provider.clone());

    let id = harness
        .submit_as("alice", "https://slow.example.com", Priority::High, Some(2))
        .await;
    assert_eq!(harness.job(&id).await.timeout_seconds, 2);

    let job = harness
        .wait_for_status(&id, JobStatus::Timeout, Duration::from_secs(6))
        .await;
    let result = job.result.unwrap();
    assert_eq!(result.exit_code, Some(-1));
    assert_eq!(
        result.error_message.as_deref(),
        Some("execution exceeded timeout of 2s")
    );
    assert!(result.duration_seconds.unwrap() >= 2.0);
    assert_eq!(provider.live_units(), 0);
}

#[tokio::test]
async fn test_rate_limited_submitter_waits_without_failing() {
    let config = test_config().with_rate_limit(2, Duration::from_secs(3600));
    let provider = ScriptedProvider::new(Script::exit_ok(20));
    let harness = TestOrchestrator::start(config, provider.clone());

    let mut mine = Vec::new();
    for i in 0..3 {
        mine.push(
            harness
                .submit_as("alice", &format!("https://a{i}.example.com"), Priority::Normal, None)
                .await,
        );
    }
    let other = harness
        .submit_as("bob", "https://b.example.com", Priority::Normal, None)
        .await;

    harness
        .wait_for_status(&mine[0], JobStatus::Completed, Duration::from_secs(3))
        .await;
    harness
        .wait_for_status(&mine[1], JobStatus::Completed, Duration::from_secs(3))
        .await;
    harness
        .wait_for_status(&other, JobStatus::Completed, Duration::from_secs(3))
        .await;

    // Give the over-limit delivery several defer cycles.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let held = harness.job(&mine[2]).await;
    assert_eq!(held.status, JobStatus::Queued);
    assert_eq!(held.delivery_attempts, 0);
    assert!(harness.orchestrator.dead_letters().is_empty());
    assert_eq!(harness.orchestrator.queues().depths(), [0, 1, 0]);
    assert_eq!(provider.provision_calls(), 3);
}

#[tokio::test]
async fn test_timeout_is_clamped_into_configured_bounds() {
    let harness = TestOrchestrator::idle(test_config(), ScriptedProvider::new(Script::exit_ok(10)));

    let defaulted = harness.submit("https://example.com", Priority::Normal).await;
    let capped = harness
        .submit_as("tester", "https://example.com/a", Priority::Normal, Some(100_000))
        .await;
    let raised = harness
        .submit_as("tester", "https://example.com/b", Priority::Normal, Some(0))
        .await;

    assert_eq!(harness.job(&defaulted).await.timeout_seconds, 30);
    assert_eq!(harness.job(&capped).await.timeout_seconds, 60);
    assert_eq!(harness.job(&raised).await.timeout_seconds, 1);
}

#[tokio::test]
async fn test_short_timeout_is_kept_under_default_config() {
    let provider = ScriptedProvider::new(Script::Hang { honor_stop: true });
    let harness = TestOrchestrator::start(OrchestratorConfig::default(), provider.clone());

    let job = harness
        .orchestrator
        .submit(
            JobRequest::new("alice", Target::new("https://slow.example.com"), Priority::Normal)
                .with_timeout(5),
        )
        .await
        .unwrap();
    assert_eq!(job.timeout_seconds, 5);

    let done = harness
        .wait_for_status(&job.id, JobStatus::Timeout, Duration::from_secs(9))
        .await;
    let result = done.result.unwrap();
    assert_eq!(result.exit_code, Some(-1));
    assert_eq!(
        result.error_message.as_deref(),
        Some("execution exceeded timeout of 5s")
    );
    let ran = result.duration_seconds.unwrap();
    assert!((5.0..8.0).contains(&ran), "ran for {ran}s");
    assert_eq!(provider.live_units(), 0);
}

#[tokio::test]
async fn test_submit_rolls_back_when_queue_is_full() {
    let mut config = test_config();
    config.queue.capacity = 1;
    let harness = TestOrchestrator::idle(config, ScriptedProvider::new(Script::exit_ok(10)));

    harness.submit("https://example.com/1", Priority::Normal).await;
    let err = harness
        .orchestrator
        .submit(JobRequest::new(
            "tester",
            Target::new("https://example.com/2"),
            Priority::Normal,
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Queue(QueueError::Full {
            priority: Priority::Normal,
            capacity: 1
        })
    ));

    let jobs = harness.orchestrator.list_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].target.url, "https://example.com/1");

    // Other tiers have their own capacity.
    harness.submit("https://example.com/3", Priority::High).await;
    assert_eq!(harness.orchestrator.list_jobs().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected_before_storage() {
    let harness = TestOrchestrator::idle(test_config(), ScriptedProvider::new(Script::exit_ok(10)));

    for request in [
        JobRequest::new("", Target::new("https://example.com"), Priority::Normal),
        JobRequest::new("tester", Target::new("ftp://example.com"), Priority::Normal),
    ] {
        let err = harness.orchestrator.submit(request).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }
    assert!(harness.orchestrator.list_jobs().await.unwrap().is_empty());
    assert_eq!(harness.orchestrator.queues().depths(), [0, 0, 0]);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let harness = TestOrchestrator::idle(test_config(), ScriptedProvider::new(Script::exit_ok(10)));
    let missing = Uuid::new_v4();

    assert!(matches!(
        harness.orchestrator.get_status(&missing).await,
        Err(OrchestratorError::JobNotFound(id)) if id == missing
    ));
    assert!(matches!(
        harness.orchestrator.cancel(&missing).await,
        Err(OrchestratorError::JobNotFound(_))
    ));
    assert!(harness.orchestrator.attach_logs(&missing).is_none());
}

#[tokio::test]
async fn test_attach_logs_follows_running_job() {
    let provider = ScriptedProvider::new(Script::exit_ok(300));
    let harness = TestOrchestrator::start(test_config(), provider);

    let id = harness.submit("https://example.com", Priority::Normal).await;
    harness
        .wait_for_status(&id, JobStatus::Running, Duration::from_secs(2))
        .await;

    let mut logs = harness
        .orchestrator
        .attach_logs(&id)
        .expect("running job has a log stream");
    let lines = tokio::time::timeout(Duration::from_secs(3), async {
        let mut lines = Vec::new();
        while let Some(line) = logs.next().await {
            lines.push(line.line);
        }
        lines
    })
    .await
    .expect("log stream never closed");

    assert!(lines.iter().any(|l| l == "agent started for https://example.com"));
    assert_eq!(lines.last().map(String::as_str), Some("agent finished with code 0"));

    harness
        .wait_for_status(&id, JobStatus::Completed, Duration::from_secs(2))
        .await;
    assert!(harness.orchestrator.attach_logs(&id).is_none());
}

#[tokio::test]
async fn test_orphaned_running_job_is_swept() {
    let harness = TestOrchestrator::start(test_config(), ScriptedProvider::new(Script::exit_ok(10)));

    // A job left running by an earlier process: no unit, no exit coming.
    let mut job = Job::new("tester", Target::new("https://example.com"), Priority::Normal, 1);
    let started = Utc::now() - chrono::Duration::seconds(30);
    job.created_at = started;
    job.advance(JobStatus::Running, started);
    let id = job.id;
    harness.orchestrator.store().insert(job).await.unwrap();

    let job = harness
        .wait_for_status(&id, JobStatus::Timeout, Duration::from_secs(2))
        .await;
    assert!(job
        .result
        .unwrap()
        .error_message
        .unwrap()
        .starts_with("execution lost"));
}

#[tokio::test]
async fn test_cancel_orphaned_running_job_settles_directly() {
    let harness = TestOrchestrator::idle(test_config(), ScriptedProvider::new(Script::exit_ok(10)));

    let mut job = Job::new("tester", Target::new("https://example.com"), Priority::Normal, 30);
    job.advance(JobStatus::Running, Utc::now());
    let id = job.id;
    harness.orchestrator.store().insert(job).await.unwrap();

    let cancelled = harness.orchestrator.cancel(&id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
}

#[tokio::test]
async fn test_cancel_after_unit_exit_leaves_exit_to_settle_job() {
    let mut harness =
        TestOrchestrator::idle(test_config(), ScriptedProvider::new(Script::exit_ok(10)));

    // The unit is gone and its exit is logged, but not yet applied.
    let mut job = Job::new("tester", Target::new("https://example.com"), Priority::Normal, 30);
    job.advance(JobStatus::Running, Utc::now());
    let id = job.id;
    harness.orchestrator.store().insert(job).await.unwrap();
    harness.orchestrator.manager().events().append(
        id,
        format!("scripted-{}", id),
        ExitOutcome::Exited {
            exit_code: 0,
            artifact_ref: None,
            logs_ref: None,
            error: None,
        },
        Duration::from_secs(1),
    );

    let returned = harness.orchestrator.cancel(&id).await.unwrap();
    assert_eq!(returned.status, JobStatus::Running);

    harness.run();
    let job = harness
        .wait_for_status(&id, JobStatus::Completed, Duration::from_secs(2))
        .await;
    assert_eq!(job.result.unwrap().exit_code, Some(0));
}

#[tokio::test]
async fn test_shutdown_stops_dispatch() {
    let provider = ScriptedProvider::new(Script::exit_ok(10));
    let mut harness = TestOrchestrator::start(test_config(), provider.clone());

    let done = harness.submit("https://example.com", Priority::Normal).await;
    harness
        .wait_for_status(&done, JobStatus::Completed, Duration::from_secs(2))
        .await;

    tokio::time::timeout(Duration::from_secs(2), harness.shutdown())
        .await
        .expect("loops did not stop");

    let left = harness.submit("https://example.com/late", Priority::High).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.job(&left).await.status, JobStatus::Queued);
    assert_eq!(provider.provision_calls(), 1);
}
