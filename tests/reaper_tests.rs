//! Recovery reaper: exit reconciliation and the lost-job sweep.


use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use ephemeral_orchestrator::scheduler::{
    Job, JobStatus, JobStore, MemoryJobStore, Priority, RecoveryReaper, Target,
};
use ephemeral_orchestrator::worker::{ExecutionManager, ExitOutcome, UnitSpec};
use test_harness::{assert_eventually, test_config, FlakyStore, Script, ScriptedProvider};

fn running_job(timeout_seconds: u64, started_secs_ago: i64) -> Job {
    let mut job = Job::new(
        "user-1",
        Target::new("https://example.com"),
        Priority::Normal,
        timeout_seconds,
    );
    let started = Utc::now() - chrono::Duration::seconds(started_secs_ago);
    job.created_at = started - chrono::Duration::seconds(1);
    job.advance(JobStatus::Running, started);
    job
}

fn exited(code: i32) -> ExitOutcome {
    ExitOutcome::Exited {
        exit_code: code,
        artifact_ref: None,
        logs_ref: None,
        error: None,
    }
}

fn setup(script: Script) -> (Arc<MemoryJobStore>, ExecutionManager, RecoveryReaper) {
    let store = Arc::new(MemoryJobStore::new());
    let provider = ScriptedProvider::new(script);
    let manager = ExecutionManager::new(provider, test_config().timeouts);
    let reaper = RecoveryReaper::new(store.clone(), manager.clone(), test_config().timeouts);
    (store, manager, reaper)
}

#[tokio::test]
async fn test_sweep_respects_timeout_plus_stop_plus_grace() {
    let (store, _manager, reaper) = setup(Script::exit_ok(10));
    let job = running_job(10, 0);
    let started = job.started_at.unwrap();
    let id = job.id;
    store.insert(job).await.unwrap();

    // 10s run timeout, 200ms stop timeout, 200ms grace.
    assert!(reaper
        .sweep_at(started + chrono::Duration::milliseconds(10_400))
        .await
        .is_empty());
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        JobStatus::Running
    );

    let reaped = reaper
        .sweep_at(started + chrono::Duration::milliseconds(10_500))
        .await;
    assert_eq!(reaped, vec![id]);

    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Timeout);
    let result = job.result.unwrap();
    assert_eq!(result.exit_code, Some(-1));
    assert!(result
        .error_message
        .unwrap()
        .starts_with("execution lost"));

    // Already terminal; a second sweep leaves it alone.
    assert!(reaper
        .sweep_at(started + chrono::Duration::seconds(60))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_sweep_ignores_jobs_that_are_not_running() {
    let (store, _manager, reaper) = setup(Script::exit_ok(10));
    let queued = Job::new("user-1", Target::new("https://example.com"), Priority::Low, 10);
    let id = queued.id;
    store.insert(queued).await.unwrap();

    let far_future = Utc::now() + chrono::Duration::hours(2);
    assert!(reaper.sweep_at(far_future).await.is_empty());
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        JobStatus::Queued
    );
}

#[tokio::test]
async fn test_sweep_terminates_a_live_unit() {
    let (store, manager, mut reaper) = setup(Script::Hang { honor_stop: true });
    let job = running_job(30, 3600);
    let id = job.id;
    store.insert(job.clone()).await.unwrap();

    let slots = Arc::new(Semaphore::new(1));
    let permit = slots.clone().acquire_owned().await.unwrap();
    manager
        .start(UnitSpec::for_job(&job), permit)
        .await
        .unwrap()
        .confirm();
    assert!(manager.is_active(&id));

    assert_eq!(reaper.sweep().await, vec![id]);

    let events = manager.events().clone();
    assert_eventually(
        || {
            let events = events.clone();
            async move { events.head() == 1 }
        },
        Duration::from_secs(2),
        "swept unit never exited",
    )
    .await;
    assert!(!manager.is_active(&id));

    // The unit's own exit arrives after the sweep and changes nothing.
    assert_eq!(reaper.process_pending().await, 0);
    assert_eq!(reaper.cursor(), 1);
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        JobStatus::Timeout
    );
}

#[tokio::test]
async fn test_process_pending_applies_missed_exits_once() {
    let (store, manager, mut reaper) = setup(Script::exit_ok(10));
    let ok = running_job(60, 5);
    let failed = running_job(60, 5);
    let (ok_id, failed_id) = (ok.id, failed.id);
    store.insert(ok).await.unwrap();
    store.insert(failed).await.unwrap();

    let events = manager.events();
    events.append(ok_id, "unit-a".to_string(), exited(0), Duration::from_secs(4));
    events.append(failed_id, "unit-b".to_string(), exited(2), Duration::from_secs(4));
    // An exit for a job the store never heard of is skipped.
    events.append(Uuid::new_v4(), "unit-c".to_string(), exited(0), Duration::ZERO);

    assert_eq!(reaper.process_pending().await, 2);
    assert_eq!(reaper.cursor(), 3);
    // The reaper is the only consumer here, so applied events are dropped.
    assert_eq!(events.retained(), 0);
    assert_eq!(events.log_offset(), 3);

    let ok = store.get(&ok_id).await.unwrap().unwrap();
    assert_eq!(ok.status, JobStatus::Completed);
    assert_eq!(ok.result.unwrap().duration_seconds, Some(4.0));
    let failed = store.get(&failed_id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.result.unwrap().exit_code, Some(2));

    assert_eq!(reaper.process_pending().await, 0);

    // A duplicate exit for a finished job moves the cursor but nothing else.
    events.append(ok_id, "unit-a".to_string(), exited(1), Duration::from_secs(1));
    assert_eq!(reaper.process_pending().await, 0);
    assert_eq!(reaper.cursor(), 4);
    assert_eq!(
        store.get(&ok_id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_process_pending_holds_cursor_on_store_fault() {
    let store = FlakyStore::new();
    let provider = ScriptedProvider::new(Script::exit_ok(10));
    let manager = ExecutionManager::new(provider, test_config().timeouts);
    let mut reaper = RecoveryReaper::new(store.clone(), manager.clone(), test_config().timeouts);

    let job = running_job(60, 5);
    let id = job.id;
    store.insert(job).await.unwrap();
    manager
        .events()
        .append(id, "unit-a".to_string(), exited(0), Duration::from_secs(2));

    store.fail_writes(JobStatus::Running, JobStatus::Completed, 1);
    assert_eq!(reaper.process_pending().await, 0);
    assert_eq!(reaper.cursor(), 0);
    assert_eq!(manager.events().retained(), 1);
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        JobStatus::Running
    );

    assert_eq!(reaper.process_pending().await, 1);
    assert_eq!(reaper.cursor(), 1);
    assert_eq!(manager.events().retained(), 0);
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}
