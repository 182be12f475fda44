//! Control surface and liveness behavior: the three pause sources, ad-hoc
//! triggers against live workers, and the watchdog kill policy. Worker
//! processes are real OS processes (a fixed `sleep` command stands in for
//! the worker binary).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use pipeline_core::config::EngineConfig;
use pipeline_core::feed::{FeedProvider, TimeWindow};
use pipeline_core::store::MemoryJobStore;
use pipeline_core::tasks::{
    DownloadStage, ScheduleUnit, StandaloneTask, TaskRegistry, TaskSettings, WorkerContext,
    WorkerLauncher,
};

/// Standalone task that always launches; its worker is the registry's
/// fixed sleep command, so the "work" is just staying alive.
struct IdleTask {
    name: &'static str,
    max_execution_minutes: i64,
}

#[async_trait]
impl StandaloneTask for IdleTask {
    fn settings(&self) -> TaskSettings {
        // cadence of an hour: only explicit triggers launch during a test
        TaskSettings::standalone(self.name, "test", self.max_execution_minutes, 1, ScheduleUnit::Hours)
    }

    async fn run(&self, _settings: &TaskSettings, _cx: &WorkerContext) -> pipeline_core::Result<()> {
        Ok(())
    }
}

fn registry(base: &Path) -> TaskRegistry {
    let mut config = EngineConfig::default();
    config.pipeline.base_path = base.to_path_buf();
    config.pipeline.pause_file = base.join("PAUSE");
    TaskRegistry::new(
        Arc::new(MemoryJobStore::new()),
        Arc::new(config),
        WorkerLauncher::fixed("sleep", vec!["30".to_string()]),
    )
}

#[tokio::test]
async fn global_pause_file_blocks_all_launches_until_removed() {
    let base = tempfile::tempdir().unwrap();
    let mut registry = registry(base.path());
    registry.add_standalone(Arc::new(IdleTask {
        name: "Idle",
        max_execution_minutes: 60,
    }));

    let pause_file = base.path().join("PAUSE");
    std::fs::write(&pause_file, b"").unwrap();

    assert!(registry.trigger("idle").await.unwrap());
    assert_eq!(registry.alive_count().await, 0);
    let snapshot = registry.snapshot_of("idle").await.unwrap();
    assert!(snapshot.paused_by_global_file);
    assert!(snapshot.effective_paused);

    // resumes immediately once the marker is gone
    std::fs::remove_file(&pause_file).unwrap();
    assert!(registry.trigger("idle").await.unwrap());
    assert_eq!(registry.alive_count().await, 1);
    let snapshot = registry.snapshot_of("idle").await.unwrap();
    assert!(!snapshot.effective_paused);

    registry.kill_all().await;
}

#[tokio::test]
async fn per_task_pause_file_pauses_only_that_pipe() {
    let base = tempfile::tempdir().unwrap();
    let mut registry = registry(base.path());

    struct NoProvider;
    #[async_trait]
    impl FeedProvider for NoProvider {
        async fn fetch(&self, _w: &TimeWindow) -> pipeline_core::Result<Vec<serde_json::Value>> {
            Ok(Vec::new())
        }
    }
    registry
        .add_pipeline(vec![Arc::new(DownloadStage::new(
            Arc::new(NoProvider),
            base.path().to_path_buf(),
        ))])
        .unwrap();

    let task_pause = base.path().join("download_working_dir").join("PAUSE");
    std::fs::write(&task_pause, b"").unwrap();

    assert!(registry.trigger("download").await.unwrap());
    let snapshot = registry.snapshot_of("download").await.unwrap();
    assert!(snapshot.paused_by_file);
    assert!(snapshot.effective_paused);

    std::fs::remove_file(&task_pause).unwrap();
    assert!(registry.trigger("download").await.unwrap());
    let snapshot = registry.snapshot_of("download").await.unwrap();
    assert!(!snapshot.paused_by_file);
    assert!(!snapshot.effective_paused);
}

#[tokio::test]
async fn explicit_pause_through_control_surface() {
    let base = tempfile::tempdir().unwrap();
    let mut registry = registry(base.path());
    registry.add_standalone(Arc::new(IdleTask {
        name: "Idle",
        max_execution_minutes: 60,
    }));

    assert!(registry.set_paused("idle", true).await);
    registry.trigger("idle").await.unwrap();
    assert_eq!(registry.alive_count().await, 0);

    assert!(registry.set_paused("idle", false).await);
    registry.trigger("idle").await.unwrap();
    assert_eq!(registry.alive_count().await, 1);
    registry.kill_all().await;
}

#[tokio::test]
async fn trigger_is_noop_while_worker_alive() {
    let base = tempfile::tempdir().unwrap();
    let mut registry = registry(base.path());
    registry.add_standalone(Arc::new(IdleTask {
        name: "Idle",
        max_execution_minutes: 60,
    }));

    registry.trigger("idle").await.unwrap();
    let first = registry.snapshot_of("idle").await.unwrap();
    let first_pid = first.process.as_ref().and_then(|p| p.pid);
    assert!(first_pid.is_some());

    // at most one live worker per task: a second trigger changes nothing
    registry.trigger("idle").await.unwrap();
    let second = registry.snapshot_of("idle").await.unwrap();
    assert_eq!(second.process.as_ref().and_then(|p| p.pid), first_pid);
    assert_eq!(registry.alive_count().await, 1);

    registry.kill_all().await;
}

#[tokio::test]
async fn watchdog_kills_only_workers_past_their_budget() {
    let base = tempfile::tempdir().unwrap();
    let mut registry = registry(base.path());
    // zero budget: stale the moment it stops beating
    registry.add_standalone(Arc::new(IdleTask {
        name: "Stale",
        max_execution_minutes: 0,
    }));
    registry.add_standalone(Arc::new(IdleTask {
        name: "Healthy",
        max_execution_minutes: 60,
    }));

    registry.trigger("stale").await.unwrap();
    registry.trigger("healthy").await.unwrap();
    assert_eq!(registry.alive_count().await, 2);

    // the sleep worker never beats; give its heartbeat a moment to age
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    registry.watchdog().await;

    let alive = registry.alive().await;
    assert_eq!(alive, vec!["Healthy".to_string()]);
    let stale = registry.snapshot_of("stale").await.unwrap();
    assert!(stale.process.is_none());

    registry.kill_all().await;
}

#[tokio::test]
async fn killed_task_can_launch_again_next_trigger() {
    let base = tempfile::tempdir().unwrap();
    let mut registry = registry(base.path());
    registry.add_standalone(Arc::new(IdleTask {
        name: "Idle",
        max_execution_minutes: 60,
    }));

    registry.trigger("idle").await.unwrap();
    assert!(registry.kill("idle").await.unwrap());
    assert_eq!(registry.alive_count().await, 0);

    registry.trigger("idle").await.unwrap();
    assert_eq!(registry.alive_count().await, 1);
    registry.kill_all().await;
}
