use super::*;
use crate::asr::mock::ScriptedEngine;
use crate::storage::task::InMemoryTaskStorage;
use crate::schedule::types::{CleanupStats, TaskStats};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};
use tracing::error;

struct Harness {
    manager: Arc<TaskManager>,
    scheduler: Arc<TaskScheduler>,
    engine: Arc<ScriptedEngine>,
    dir: TempDir,
}

fn test_config(max_concurrent_tasks: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_tasks,
        max_backlog: 16,
        queue_timeout: None,
        task_timeout: None,
        cleanup_after: Duration::from_secs(3600),
        cleanup_interval: None,
    }
}

// 测试辅助函数：创建测试环境
fn setup_test_environment(engine: Arc<ScriptedEngine>, config: SchedulerConfig) -> Harness {
    let storage = Arc::new(InMemoryTaskStorage::new());
    let processor = Arc::new(TranscribeProcessor::new(engine.clone()));
    let (manager, scheduler) = create_scheduler(storage, processor, config);

    tokio::spawn({
        let scheduler = scheduler.clone();
        async move {
            if let Err(e) = scheduler.run().await {
                error!("Scheduler error: {}", e);
            }
        }
    });

    Harness {
        manager,
        scheduler,
        engine,
        dir: tempfile::tempdir().unwrap(),
    }
}

impl Harness {
    fn audio(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"RIFF....WAVE").unwrap();
        path
    }

    async fn submit(&self, name: &str) -> Task {
        self.submit_with(TaskConfig::new(self.audio(name), TranscribeOptions::default()))
            .await
            .unwrap()
    }

    async fn submit_with(&self, config: TaskConfig) -> Result<Task, TaskError> {
        self.manager.create_task(config).await
    }

    async fn stats(&self) -> TaskStats {
        self.manager.get_stats().await.unwrap()
    }
}

async fn wait_for(manager: &TaskManager, task_id: &str, what: &str, check: impl Fn(&Task) -> bool) -> Task {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let task = manager.get_task(task_id).await.unwrap();
        if check(&task) {
            return task;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for task {} to be {} (status {}, progress {})",
            task_id,
            what,
            task.status,
            task.progress
        );
        sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_status(manager: &TaskManager, task_id: &str, status: TaskStatus) -> Task {
    wait_for(manager, task_id, &status.to_string(), |t| t.status == status).await
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting until {}", what);
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_complete_task_lifecycle() {
    let h = setup_test_environment(ScriptedEngine::immediate(), test_config(2));

    let task = h.submit("meeting.wav").await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.progress, 0.0);

    let done = wait_status(&h.manager, &task.id, TaskStatus::Completed).await;
    assert_eq!(done.progress, 100.0);
    assert!(done.started_at.is_some() && done.completed_at.is_some());
    assert!(done.started_at <= done.completed_at);
    assert!(done.error.is_none());

    let result = h.manager.get_result(&task.id).await.unwrap();
    assert_eq!(result.segments[0].text, "transcript of meeting.wav");
    assert_eq!(result.segments[0].speaker.as_deref(), Some("SPEAKER_00"));

    wait_until("input is released", || !task.config.input_path.exists()).await;
}

#[tokio::test]
async fn test_five_tasks_with_two_slots() {
    let h = setup_test_environment(ScriptedEngine::gated(), test_config(2));

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(h.submit(&format!("clip-{}.wav", i)).await.id);
    }

    wait_until("two engines run", || h.engine.running() == 2).await;
    let stats = h.stats().await;
    assert_eq!((stats.processing, stats.pending, stats.total), (2, 3, 5));
    assert_eq!(h.manager.limiter().in_use(), 2);

    h.engine.release(1);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = h.stats().await;
        if (stats.completed, stats.processing, stats.pending) == (1, 2, 2) {
            break;
        }
        assert!(Instant::now() < deadline, "next task never admitted: {:?}", stats);
        sleep(Duration::from_millis(5)).await;
    }

    h.engine.release(4);
    for id in &ids {
        wait_status(&h.manager, id, TaskStatus::Completed).await;
    }

    assert!(h.engine.peak() <= 2, "peak concurrency was {}", h.engine.peak());
    wait_until("slots are free", || h.manager.limiter().in_use() == 0).await;
    let mut started = h.engine.started();
    started.sort();
    assert_eq!(started, (0..5).map(|i| format!("clip-{}.wav", i)).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_admission_follows_submission_order() {
    let h = setup_test_environment(ScriptedEngine::immediate(), test_config(1));

    let names: Vec<String> = (0..6).map(|i| format!("ordered-{}.wav", i)).collect();
    let mut ids = Vec::new();
    for name in &names {
        ids.push(h.submit(name).await.id);
    }
    for id in &ids {
        wait_status(&h.manager, id, TaskStatus::Completed).await;
    }

    assert_eq!(h.engine.started(), names);
    assert_eq!(h.engine.peak(), 1);
}

#[tokio::test]
async fn test_engine_error_fails_only_that_task() {
    let h = setup_test_environment(ScriptedEngine::gated(), test_config(1));

    let bad = h.submit("fail-corrupt.wav").await;
    let good = h.submit("good.wav").await;

    let failed = wait_status(&h.manager, &bad.id, TaskStatus::Failed).await;
    let failure = failed.error.expect("failed task carries an error");
    assert_eq!(failure.kind, FailureKind::InvalidAudio);
    assert!(!failure.message.is_empty());
    assert!(failed.result.is_none());

    // the slot came back, so the next task is admitted
    wait_status(&h.manager, &good.id, TaskStatus::Processing).await;
    h.engine.release(1);
    wait_status(&h.manager, &good.id, TaskStatus::Completed).await;

    match h.manager.get_result(&bad.id).await {
        Err(TaskError::Failed { failure, .. }) => assert_eq!(failure.kind, FailureKind::InvalidAudio),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_engine_panic_is_contained() {
    let h = setup_test_environment(ScriptedEngine::immediate(), test_config(1));

    let boom = h.submit("panic.wav").await;
    let next = h.submit("after.wav").await;

    let failed = wait_status(&h.manager, &boom.id, TaskStatus::Failed).await;
    assert_eq!(failed.error.map(|e| e.kind), Some(FailureKind::Internal));
    wait_status(&h.manager, &next.id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_cancel_pending_never_runs() {
    let h = setup_test_environment(ScriptedEngine::gated(), test_config(1));

    let first = h.submit("first.wav").await;
    let queued = h.submit("queued.wav").await;
    wait_status(&h.manager, &first.id, TaskStatus::Processing).await;

    let cancelled = h.manager.cancel_task(&queued.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    assert!(!queued.config.input_path.exists());

    h.engine.release(1);
    wait_status(&h.manager, &first.id, TaskStatus::Completed).await;
    sleep(Duration::from_millis(30)).await;

    let queued = h.manager.get_task(&queued.id).await.unwrap();
    assert_eq!(queued.status, TaskStatus::Cancelled);
    assert!(queued.started_at.is_none());
    assert_eq!(h.engine.started(), vec!["first.wav".to_string()]);
    assert!(matches!(h.manager.get_result(&queued.id).await, Err(TaskError::Cancelled(_))));
}

#[tokio::test]
async fn test_cancel_processing_is_cooperative() {
    let h = setup_test_environment(ScriptedEngine::gated(), test_config(1));

    let task = h.submit("long.wav").await;
    wait_for(&h.manager, &task.id, "reporting", |t| t.progress >= 10.0).await;

    let cancelled = h.manager.cancel_task(&task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    wait_until("engine stops", || h.engine.running() == 0).await;
    wait_until("slot is free", || h.manager.limiter().in_use() == 0).await;
    wait_until("input is released", || !task.config.input_path.exists()).await;

    let after = h.manager.get_task(&task.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Cancelled);
    assert_eq!(after.progress, cancelled.progress);
    assert!(after.result.is_none());
}

#[tokio::test]
async fn test_cancelled_engine_keeps_slot_until_it_returns() {
    let h = setup_test_environment(ScriptedEngine::gated(), test_config(1));

    let stubborn = h.submit("stubborn.wav").await;
    let next = h.submit("next.wav").await;
    wait_status(&h.manager, &stubborn.id, TaskStatus::Processing).await;

    h.manager.cancel_task(&stubborn.id).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    // cancelled in the store, but the engine still holds the accelerator
    assert_eq!(h.manager.get_task(&stubborn.id).await.unwrap().status, TaskStatus::Cancelled);
    assert_eq!(h.manager.get_task(&next.id).await.unwrap().status, TaskStatus::Pending);
    assert_eq!(h.manager.limiter().in_use(), 1);

    h.engine.release(1);
    wait_status(&h.manager, &next.id, TaskStatus::Processing).await;
    assert_eq!(h.manager.get_task(&stubborn.id).await.unwrap().status, TaskStatus::Cancelled);

    h.engine.release(1);
    wait_status(&h.manager, &next.id, TaskStatus::Completed).await;
    assert_eq!(h.engine.peak(), 1);
}

#[tokio::test]
async fn test_progress_never_regresses() {
    let h = setup_test_environment(ScriptedEngine::gated(), test_config(1));

    let task = h.submit("regress.wav").await;
    let seen = wait_for(&h.manager, &task.id, "aligning", |t| t.message == "aligning").await;
    assert_eq!(seen.progress, 60.0);

    h.engine.release(1);
    wait_status(&h.manager, &task.id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_progress_after_completion_is_ignored() {
    let h = setup_test_environment(ScriptedEngine::immediate(), test_config(1));

    let task = h.submit("late.wav").await;
    let done = wait_status(&h.manager, &task.id, TaskStatus::Completed).await;
    sleep(Duration::from_millis(60)).await;

    let after = h.manager.get_task(&task.id).await.unwrap();
    assert_eq!(after.progress, 100.0);
    assert_eq!(after.message, done.message);
    assert_eq!(after.updated_at, done.updated_at);
}

#[tokio::test]
async fn test_backlog_overflow_is_rejected() {
    let mut config = test_config(1);
    config.max_backlog = 2;
    let h = setup_test_environment(ScriptedEngine::gated(), config);

    let running = h.submit("running.wav").await;
    wait_status(&h.manager, &running.id, TaskStatus::Processing).await;

    // one waits on the limiter, the other is still queued
    let waiting = h.submit("waiting.wav").await;
    let queued = h.submit("queued.wav").await;
    assert_eq!(h.manager.backlog(), 2);

    let overflow = h.audio("overflow.wav");
    let err = h
        .submit_with(TaskConfig::new(&overflow, TranscribeOptions::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::CapacityExceeded { backlog: 2 }));
    assert_eq!(h.stats().await.total, 3);

    h.engine.release(1);
    wait_status(&h.manager, &waiting.id, TaskStatus::Processing).await;
    assert_eq!(h.manager.backlog(), 1);
    h.engine.release(2);
    wait_status(&h.manager, &queued.id, TaskStatus::Completed).await;
    assert_eq!(h.manager.backlog(), 0);
}

#[tokio::test]
async fn test_withdrawn_tasks_free_the_backlog() {
    let mut config = test_config(1);
    config.max_backlog = 2;
    let h = setup_test_environment(ScriptedEngine::gated(), config);

    let running = h.submit("running.wav").await;
    wait_status(&h.manager, &running.id, TaskStatus::Processing).await;
    let waiting = h.submit("waiting.wav").await;
    let queued = h.submit("queued.wav").await;

    // withdrawn while still pending
    h.manager.cancel_task(&queued.id).await.unwrap();
    h.manager.delete_task(&waiting.id).await.unwrap();
    assert_eq!(h.manager.backlog(), 0);

    let first = h.submit("fresh-1.wav").await;
    let second = h.submit("fresh-2.wav").await;
    assert_eq!(h.stats().await.pending, 2);

    h.engine.release(3);
    wait_status(&h.manager, &second.id, TaskStatus::Completed).await;
    assert_eq!(h.manager.get_task(&first.id).await.unwrap().status, TaskStatus::Completed);
    assert_eq!(
        h.engine.started(),
        vec!["running.wav".to_string(), "fresh-1.wav".to_string(), "fresh-2.wav".to_string()]
    );
}

#[tokio::test]
async fn test_queue_wait_ceiling() {
    let mut config = test_config(1);
    config.queue_timeout = Some(Duration::from_millis(50));
    let h = setup_test_environment(ScriptedEngine::gated(), config);

    let running = h.submit("running.wav").await;
    let starved = h.submit("starved.wav").await;

    let failed = wait_status(&h.manager, &starved.id, TaskStatus::Failed).await;
    assert_eq!(failed.error.map(|e| e.kind), Some(FailureKind::CapacityExceeded));
    assert!(failed.started_at.is_none());
    wait_until("input is released", || !starved.config.input_path.exists()).await;

    h.engine.release(1);
    wait_status(&h.manager, &running.id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_task_timeout() {
    let mut config = test_config(1);
    config.task_timeout = Some(Duration::from_millis(50));
    let h = setup_test_environment(ScriptedEngine::gated(), config);

    let task = h.submit("endless.wav").await;
    let failed = wait_status(&h.manager, &task.id, TaskStatus::Failed).await;
    assert_eq!(failed.error.map(|e| e.kind), Some(FailureKind::Timeout));

    // the engine honours the token and gives the slot back
    wait_until("slot is free", || h.manager.limiter().in_use() == 0).await;
}

#[tokio::test]
async fn test_delete_task() {
    let h = setup_test_environment(ScriptedEngine::immediate(), test_config(1));

    let config = TaskConfig::new(h.audio("kept.wav"), TranscribeOptions::default()).with_retain_input(true);
    let task = h.submit_with(config).await.unwrap();
    wait_status(&h.manager, &task.id, TaskStatus::Completed).await;
    assert!(task.config.input_path.exists());

    let removed = h.manager.delete_task(&task.id).await.unwrap();
    assert_eq!(removed.id, task.id);
    assert!(!task.config.input_path.exists());
    assert!(matches!(h.manager.get_task(&task.id).await, Err(TaskError::NotFound(_))));
    assert!(matches!(h.manager.delete_task(&task.id).await, Err(TaskError::NotFound(_))));

    let page = h.manager.list_tasks(&crate::web::Pagination::default(), None).await.unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn test_delete_running_task() {
    let h = setup_test_environment(ScriptedEngine::gated(), test_config(1));

    let task = h.submit("running.wav").await;
    wait_status(&h.manager, &task.id, TaskStatus::Processing).await;

    h.manager.delete_task(&task.id).await.unwrap();
    assert!(!task.config.input_path.exists());
    wait_until("slot is free", || h.manager.limiter().in_use() == 0).await;
    assert!(matches!(h.manager.get_task(&task.id).await, Err(TaskError::NotFound(_))));
}

#[tokio::test]
async fn test_retain_input_keeps_artifact() {
    let h = setup_test_environment(ScriptedEngine::immediate(), test_config(1));

    let config = TaskConfig::new(h.audio("archive.wav"), TranscribeOptions::default()).with_retain_input(true);
    let kept = h.submit_with(config).await.unwrap();
    let dropped = h.submit("scratch.wav").await;

    wait_status(&h.manager, &kept.id, TaskStatus::Completed).await;
    wait_status(&h.manager, &dropped.id, TaskStatus::Completed).await;
    wait_until("scratch input is released", || !dropped.config.input_path.exists()).await;
    assert!(kept.config.input_path.exists());
}

#[tokio::test]
async fn test_query_errors() {
    let h = setup_test_environment(ScriptedEngine::gated(), test_config(1));

    assert!(matches!(h.manager.get_progress("no-such-task").await, Err(TaskError::NotFound(_))));
    assert!(matches!(h.manager.get_result("no-such-task").await, Err(TaskError::NotFound(_))));
    assert!(matches!(h.manager.cancel_task("no-such-task").await, Err(TaskError::NotFound(_))));

    let running = h.submit("running.wav").await;
    let pending = h.submit("pending.wav").await;
    wait_status(&h.manager, &running.id, TaskStatus::Processing).await;

    match h.manager.get_result(&pending.id).await {
        Err(TaskError::NotReady { status, .. }) => assert_eq!(status, TaskStatus::Pending),
        other => panic!("unexpected result: {:?}", other),
    }
    let view = h.manager.get_progress(&pending.id).await.unwrap();
    assert_eq!(view.task_id, pending.id);
    assert_eq!(view.status, TaskStatus::Pending);

    h.engine.release(2);
    wait_status(&h.manager, &running.id, TaskStatus::Completed).await;
    let err = h.manager.cancel_task(&running.id).await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidTransition { from: TaskStatus::Completed, .. }));
}

#[tokio::test]
async fn test_invalid_params_leave_no_record() {
    let h = setup_test_environment(ScriptedEngine::immediate(), test_config(1));

    let options = TranscribeOptions {
        min_speakers: Some(3),
        max_speakers: Some(1),
        ..TranscribeOptions::default()
    };
    let err = h.submit_with(TaskConfig::new(h.audio("a.wav"), options)).await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidParams(_)));

    let missing = TaskConfig::new(h.dir.path().join("missing.wav"), TranscribeOptions::default());
    assert!(matches!(h.submit_with(missing).await, Err(TaskError::InvalidParams(_))));
    assert_eq!(h.stats().await.total, 0);
}

#[tokio::test]
async fn test_cleanup_removes_only_old_terminal_tasks() {
    let h = setup_test_environment(ScriptedEngine::gated(), test_config(1));

    let finished = h.submit("fail-old.wav").await;
    wait_status(&h.manager, &finished.id, TaskStatus::Failed).await;
    let running = h.submit("running.wav").await;
    let pending = h.submit("pending.wav").await;
    wait_status(&h.manager, &running.id, TaskStatus::Processing).await;

    let stats = h.manager.cleanup_tasks(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(stats, CleanupStats::default());

    sleep(Duration::from_millis(10)).await;
    let stats = h.manager.cleanup_tasks(Duration::ZERO).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed + stats.cancelled, 0);

    assert!(matches!(h.manager.get_task(&finished.id).await, Err(TaskError::NotFound(_))));
    assert!(h.manager.get_task(&running.id).await.is_ok());
    assert!(h.manager.get_task(&pending.id).await.is_ok());
    h.engine.release(2);
}

#[tokio::test]
async fn test_reaper_runs_in_background() {
    let mut config = test_config(1);
    config.cleanup_after = Duration::ZERO;
    config.cleanup_interval = Some(Duration::from_millis(20));
    let h = setup_test_environment(ScriptedEngine::immediate(), config);

    let task = h.submit("short.wav").await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.manager.get_task(&task.id).await.is_ok() {
        assert!(Instant::now() < deadline, "reaper never removed task");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_list_tasks_pages_and_filters() {
    let h = setup_test_environment(ScriptedEngine::gated(), test_config(1));

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(h.submit(&format!("page-{}.wav", i)).await.id);
        sleep(Duration::from_millis(2)).await;
    }
    wait_status(&h.manager, &ids[0], TaskStatus::Processing).await;

    let page = h
        .manager
        .list_tasks(&crate::web::Pagination { index: 2, size: 2 }, None)
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    let listed: Vec<&str> = page.tasks.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(listed, vec![ids[2].as_str(), ids[3].as_str()]);

    let pending = h
        .manager
        .list_tasks(&crate::web::Pagination::default(), Some(TaskStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.total, 4);
    h.engine.release(5);
}

#[tokio::test]
async fn test_scheduler_runs_once_and_shuts_down() {
    let h = setup_test_environment(ScriptedEngine::immediate(), test_config(1));
    sleep(Duration::from_millis(10)).await;

    // the spawned run owns the queue
    assert!(h.scheduler.run().await.is_err());

    h.scheduler.shutdown();
    sleep(Duration::from_millis(20)).await;
    let err = h.submit_with(TaskConfig::new(h.audio("after-shutdown.wav"), TranscribeOptions::default())).await;
    assert!(matches!(err, Err(TaskError::SchedulerUnavailable)));
    assert_eq!(h.manager.backlog(), 0);
    assert_eq!(h.stats().await.total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_processing_on_multi_thread_runtime() {
    let h = setup_test_environment(ScriptedEngine::gated(), test_config(1));

    for i in 0..50 {
        let task = h.submit(&format!("run-{}.wav", i)).await;
        wait_status(&h.manager, &task.id, TaskStatus::Processing).await;

        let cancelled = h.manager.cancel_task(&task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        wait_until("slot is free", || h.manager.limiter().in_use() == 0).await;
        let after = h.manager.get_task(&task.id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Cancelled, "run {}", i);
        assert!(after.error.is_none());
        assert!(matches!(h.manager.get_result(&task.id).await, Err(TaskError::Cancelled(_))));
    }
    assert_eq!(h.stats().await.cancelled, 50);
    assert_eq!(h.manager.backlog(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_processing_on_multi_thread_runtime() {
    let h = setup_test_environment(ScriptedEngine::gated(), test_config(1));

    for i in 0..50 {
        let task = h.submit(&format!("run-{}.wav", i)).await;
        wait_status(&h.manager, &task.id, TaskStatus::Processing).await;

        let deleted = h.manager.delete_task(&task.id).await.unwrap();
        assert_eq!(deleted.id, task.id);

        wait_until("slot is free", || h.manager.limiter().in_use() == 0).await;
        assert!(matches!(h.manager.get_task(&task.id).await, Err(TaskError::NotFound(_))));
        assert!(!task.config.input_path.exists());
    }
    assert_eq!(h.stats().await.total, 0);
}
