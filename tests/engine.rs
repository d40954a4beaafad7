//! End-to-end tests of the engine lifecycle: setup, suspend/continue,
//! snapshot and restore, teardown, and the stage control contract.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use spider_engine::engine;
use spider_engine::error::EngineError;
use spider_engine::registry;
use spider_engine::{
    async_trait, Component, ControlAck, EngineBuilder, EngineStatus, OptionValue, Options,
    SpiderHooks, SpiderId, Stage, StageCommand, StageHandle, StopReason, TableRole,
};

/// A stage that honors the control protocol and otherwise does nothing, so
/// tests fully control the table contents.
struct IdleStage;

#[async_trait]
impl Stage for IdleStage {
    async fn start(
        &self,
        component: Component,
        _options: &Options,
    ) -> Result<StageHandle, EngineError> {
        let (control_tx, control_rx) = kanal::unbounded_async();
        let worker = tokio::spawn(async move {
            while let Ok(command) = control_rx.recv().await {
                match command {
                    StageCommand::Suspend { responder } | StageCommand::Resume { responder } => {
                        let _ = responder.send(ControlAck::Ok);
                    }
                    StageCommand::Stop => break,
                }
            }
        });
        Ok(StageHandle::new(component, control_tx, worker))
    }
}

/// A stage that refuses to suspend.
struct VetoStage;

#[async_trait]
impl Stage for VetoStage {
    async fn start(
        &self,
        component: Component,
        _options: &Options,
    ) -> Result<StageHandle, EngineError> {
        let (control_tx, control_rx) = kanal::unbounded_async();
        let worker = tokio::spawn(async move {
            while let Ok(command) = control_rx.recv().await {
                match command {
                    StageCommand::Suspend { responder } => {
                        let _ = responder.send(ControlAck::Refused("mid-flush".into()));
                    }
                    StageCommand::Resume { responder } => {
                        let _ = responder.send(ControlAck::Ok);
                    }
                    StageCommand::Stop => break,
                }
            }
        });
        Ok(StageHandle::new(component, control_tx, worker))
    }
}

/// A stage that takes a while to quiesce before acknowledging.
struct SlowStage {
    delay: Duration,
}

#[async_trait]
impl Stage for SlowStage {
    async fn start(
        &self,
        component: Component,
        _options: &Options,
    ) -> Result<StageHandle, EngineError> {
        let delay = self.delay;
        let (control_tx, control_rx) = kanal::unbounded_async();
        let worker = tokio::spawn(async move {
            while let Ok(command) = control_rx.recv().await {
                match command {
                    StageCommand::Suspend { responder } => {
                        tokio::time::sleep(delay).await;
                        let _ = responder.send(ControlAck::Ok);
                    }
                    StageCommand::Resume { responder } => {
                        let _ = responder.send(ControlAck::Ok);
                    }
                    StageCommand::Stop => break,
                }
            }
        });
        Ok(StageHandle::new(component, control_tx, worker))
    }
}

/// Records every hook invocation and the bundles it saw.
#[derive(Default)]
struct RecordingHooks {
    start_calls: AtomicUsize,
    start_component_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    stop_component_calls: AtomicUsize,
    started_bundles: Mutex<HashMap<Component, Options>>,
    stopped_bundles: Mutex<HashMap<Component, Options>>,
}

#[async_trait]
impl SpiderHooks for RecordingHooks {
    async fn prepare_for_start_component(
        &self,
        component: Component,
        options: Options,
    ) -> Result<Options, EngineError> {
        self.start_component_calls.fetch_add(1, Ordering::SeqCst);
        let options = options.with("traced", OptionValue::Flag(true));
        self.started_bundles
            .lock()
            .unwrap()
            .insert(component, options.clone());
        Ok(options)
    }

    async fn prepare_for_start(
        &self,
        _ctx: &spider_engine::EngineContext,
    ) -> Result<(), EngineError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn prepare_for_stop_component(
        &self,
        component: Component,
        options: &Options,
    ) -> Result<(), EngineError> {
        self.stop_component_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped_bundles
            .lock()
            .unwrap()
            .insert(component, options.clone());
        Ok(())
    }

    async fn prepare_for_stop(&self) -> Result<(), EngineError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn idle_engine(spider: &str) -> EngineBuilder {
    init_tracing();
    EngineBuilder::new(spider)
        .downloader_stage(Arc::new(IdleStage))
        .spider_stage(Arc::new(IdleStage))
        .item_processor_stage(Arc::new(IdleStage))
}

async fn wait_until_gone(spider: &SpiderId) {
    for _ in 0..200 {
        if registry::engine(spider).is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("engine {spider} still registered");
}

#[tokio::test]
async fn lifecycle_runs_suspends_resumes_and_stops() {
    let handle = EngineBuilder::new("e2e-lifecycle").start().unwrap();

    // Queued behind setup, so the first answer is already `running`.
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Running);

    handle.suspend(None).await.unwrap();
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Suspended);

    handle.resume(None).await.unwrap();
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Running);

    handle.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(handle.spider()).await;

    assert!(matches!(
        handle.status().await,
        Err(EngineError::EngineDown)
    ));
    let spider = SpiderId::from("e2e-lifecycle");
    assert!(matches!(
        engine::status(&spider).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn by_spider_control_api_reaches_the_engine() {
    let spider = SpiderId::from("e2e-by-name");
    let _handle = idle_engine("e2e-by-name").start().unwrap();

    assert_eq!(engine::status(&spider).await.unwrap(), EngineStatus::Running);
    engine::suspend(&spider, None).await.unwrap();
    assert_eq!(
        engine::status(&spider).await.unwrap(),
        EngineStatus::Suspended
    );
    engine::resume(&spider, None).await.unwrap();

    engine::stop(&spider, StopReason::Normal).await.unwrap();
    wait_until_gone(&spider).await;
}

#[tokio::test]
async fn duplicate_spider_ids_cannot_coexist() {
    let handle = idle_engine("e2e-duplicate").start().unwrap();

    let err = idle_engine("e2e-duplicate").start().unwrap_err();
    assert!(matches!(err, EngineError::AlreadyStarted(_)));

    handle.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(handle.spider()).await;
}

#[tokio::test]
async fn dump_is_rejected_outside_suspend_and_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("gate");
    let handle = idle_engine("e2e-dump-gate").start().unwrap();

    let err = handle
        .dump2file(Some(base.clone()), None)
        .await
        .unwrap_err();
    match err {
        EngineError::StatusError { status } => assert_eq!(status, EngineStatus::Running),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    handle.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(handle.spider()).await;
}

#[tokio::test]
async fn dump_then_restore_preserves_table_contents() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("crawl");
    let spider = SpiderId::from("e2e-dump");

    let handle = idle_engine("e2e-dump").start().unwrap();
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Running);

    let spider_table = registry::lookup_table(&spider, Component::Spider.tid_key()).unwrap();
    spider_table.insert("p1", json!({"url": "https://example.com/1"}));
    spider_table.insert("p2", json!({"url": "https://example.com/2"}));
    spider_table.insert("p3", json!({"url": "https://example.com/3"}));

    handle.suspend(None).await.unwrap();
    let written = handle.dump2file(Some(base.clone()), None).await.unwrap();
    assert_eq!(written, base);
    for role in TableRole::ALL {
        assert!(role.file_for(&base).is_file(), "missing {role} file");
    }

    handle.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(&spider).await;

    let restored = idle_engine("e2e-dump-restored")
        .load_from_file(&base)
        .start()
        .unwrap();
    assert_eq!(restored.status().await.unwrap(), EngineStatus::Running);

    let restored_spider = SpiderId::from("e2e-dump-restored");
    let table = registry::lookup_table(&restored_spider, Component::Spider.tid_key()).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.get("p2"), Some(json!({"url": "https://example.com/2"})));

    restored.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(&restored_spider).await;
}

#[tokio::test]
async fn empty_tables_dump_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("empty");

    let handle = idle_engine("e2e-empty-dump").start().unwrap();
    handle.suspend(None).await.unwrap();
    handle.dump2file_force(Some(base.clone()), None).await.unwrap();
    handle.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(handle.spider()).await;

    let restored = idle_engine("e2e-empty-restored")
        .load_from_file(&base)
        .start()
        .unwrap();
    assert_eq!(restored.status().await.unwrap(), EngineStatus::Running);

    let spider = SpiderId::from("e2e-empty-restored");
    let table = registry::lookup_table(&spider, Component::Downloader.tid_key()).unwrap();
    assert!(table.is_empty());

    restored.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(&spider).await;
}

#[tokio::test]
async fn load_failure_aborts_setup() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("nothing-here");
    let spider = SpiderId::from("e2e-load-failure");

    let handle = idle_engine("e2e-load-failure")
        .load_from_file(&base)
        .start()
        .unwrap();

    // Setup fails on the first missing file; the actor exits and the name
    // is released.
    wait_until_gone(&spider).await;
    assert!(matches!(
        handle.status().await,
        Err(EngineError::EngineDown)
    ));
}

#[tokio::test]
async fn suspend_and_resume_are_idempotent() {
    let handle = EngineBuilder::new("e2e-idempotent").start().unwrap();

    handle.suspend(None).await.unwrap();
    handle.suspend(None).await.unwrap();
    handle.suspend(None).await.unwrap();
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Suspended);

    handle.resume(None).await.unwrap();
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Running);
    handle.resume(None).await.unwrap();
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Running);

    handle.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(handle.spider()).await;
}

#[tokio::test]
async fn hooks_run_once_per_edge_and_bundles_match() {
    let hooks = Arc::new(RecordingHooks::default());
    let handle = idle_engine("e2e-hooks")
        .hooks(hooks.clone())
        .start()
        .unwrap();

    assert_eq!(handle.status().await.unwrap(), EngineStatus::Running);
    assert_eq!(hooks.start_calls.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.start_component_calls.load(Ordering::SeqCst), 3);
    assert_eq!(hooks.stop_calls.load(Ordering::SeqCst), 0);

    handle.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(handle.spider()).await;

    assert_eq!(hooks.stop_component_calls.load(Ordering::SeqCst), 3);
    assert_eq!(hooks.stop_calls.load(Ordering::SeqCst), 1);

    // Each stage is stopped with the exact bundle it was started with.
    let started = hooks.started_bundles.lock().unwrap();
    let stopped = hooks.stopped_bundles.lock().unwrap();
    for component in Component::ALL {
        assert_eq!(started.get(&component), stopped.get(&component));
    }
}

#[tokio::test]
async fn framework_prefix_wins_over_user_overrides() {
    let hooks = Arc::new(RecordingHooks::default());
    let handle = idle_engine("e2e-prefix")
        .downloader_options(
            Options::new()
                .with("tid", OptionValue::Text("forged".into()))
                .with("concurrency", OptionValue::Int(4)),
        )
        .hooks(hooks.clone())
        .start()
        .unwrap();
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Running);

    let started = hooks.started_bundles.lock().unwrap();
    let bundle = started.get(&Component::Downloader).unwrap();
    assert!(bundle.get("tid").unwrap().as_table().is_some());
    assert_eq!(bundle.get("concurrency"), Some(&OptionValue::Int(4)));
    assert_eq!(
        bundle.get("spider").and_then(|v| v.as_str()),
        Some("e2e-prefix")
    );
    drop(started);

    handle.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(handle.spider()).await;
}

#[tokio::test]
async fn stage_veto_terminates_the_engine() {
    let spider = SpiderId::from("e2e-veto");
    let handle = idle_engine("e2e-veto")
        .spider_stage(Arc::new(VetoStage))
        .start()
        .unwrap();
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Running);

    let err = handle.suspend(None).await.unwrap_err();
    match err {
        EngineError::ControlContract { component, reply } => {
            assert_eq!(component, Component::Spider);
            assert_eq!(reply, "mid-flush");
        }
        other => panic!("unexpected error: {other}"),
    }

    // The contract violation is fatal: the engine is gone, not lying about
    // its status.
    wait_until_gone(&spider).await;
}

#[tokio::test]
async fn slow_acknowledgement_blocks_the_caller() {
    let delay = Duration::from_millis(150);
    let handle = idle_engine("e2e-slow")
        .item_processor_stage(Arc::new(SlowStage { delay }))
        .start()
        .unwrap();
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Running);

    let started = tokio::time::Instant::now();
    handle.suspend(None).await.unwrap();
    assert!(started.elapsed() >= delay);
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Suspended);

    handle.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(handle.spider()).await;
}

#[tokio::test]
async fn timed_out_suspend_aborts_the_waiter_not_the_transition() {
    let handle = idle_engine("e2e-timeout")
        .downloader_stage(Arc::new(SlowStage {
            delay: Duration::from_millis(200),
        }))
        .start()
        .unwrap();
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Running);

    let err = handle
        .suspend(Some(Duration::from_millis(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout { .. }));

    // The broadcast kept running inside the actor; once it lands the
    // engine reports suspended.
    for _ in 0..200 {
        if handle.status().await.unwrap() == EngineStatus::Suspended {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Suspended);

    handle.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(handle.spider()).await;
}

#[tokio::test]
async fn registry_publishes_the_four_table_keys() {
    let spider = SpiderId::from("e2e-registry");
    let handle = idle_engine("e2e-registry").start().unwrap();
    assert_eq!(handle.status().await.unwrap(), EngineStatus::Running);

    for key in [
        "common_pipeline_tid",
        "downloader_tid",
        "spider_tid",
        "item_processor_tid",
    ] {
        assert!(
            registry::lookup_table(&spider, key).is_some(),
            "missing registry entry for {key}"
        );
    }

    handle.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(&spider).await;
    assert!(registry::lookup_table(&spider, "spider_tid").is_none());
}

#[tokio::test]
async fn default_dump_base_is_derived_from_spider_and_time() {
    let handle = idle_engine("e2e-default-base").start().unwrap();
    handle.suspend(None).await.unwrap();

    let base = handle.dump2file(None, None).await.unwrap();
    let rendered = base.to_string_lossy().into_owned();
    assert!(rendered.contains("data/e2e-default-base_"));
    for role in TableRole::ALL {
        let file = role.file_for(&base);
        assert!(file.is_file());
        std::fs::remove_file(file).unwrap();
    }
    let _ = std::fs::remove_dir(PathBuf::from("./data"));

    handle.stop(StopReason::Normal).await.unwrap();
    wait_until_gone(handle.spider()).await;
}

#[tokio::test]
async fn empty_spider_id_is_a_configuration_error() {
    assert!(matches!(
        EngineBuilder::new("").start(),
        Err(EngineError::Configuration(_))
    ));
}
