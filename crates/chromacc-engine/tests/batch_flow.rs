//! End-to-end batch flows over a scripted pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use chromacc_core::models::ImageRecord;
use chromacc_core::pipeline::StageFlags;
use chromacc_core::testing::{write_test_png, Script, ScriptedFactory};
use chromacc_engine::orchestrator::BatchRequest;
use chromacc_engine::{
    BatchOrchestrator, EngineConfig, EngineError, ItemStatus, SessionRegistry, ShutdownCoordinator,
};

struct Rig {
    orchestrator: BatchOrchestrator,
    registry: Arc<SessionRegistry>,
    script: Arc<Script>,
    _dir: TempDir,
}

fn rig(image_count: usize, script: Script, config: EngineConfig) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SessionRegistry::new());

    let mut records = Vec::new();
    for i in 0..image_count {
        let filename = format!("img{i}.png");
        let path = dir.path().join(&filename);
        write_test_png(&path).unwrap();
        records.push(ImageRecord::new(&filename, &path));
    }
    registry.add_images(records);

    let factory = ScriptedFactory::new(script);
    let script = Arc::clone(&factory.script);
    let orchestrator = BatchOrchestrator::new(Arc::clone(&registry), Arc::new(factory), config);

    Rig {
        orchestrator,
        registry,
        script,
        _dir: dir,
    }
}

fn full_run() -> BatchRequest {
    BatchRequest {
        indices: None,
        stages: StageFlags {
            gc: true,
            cc: true,
            ..Default::default()
        },
        method: "pls".to_string(),
        workers: None,
    }
}

#[test]
fn batch_completes_all_items() {
    let rig = rig(3, Script::default(), EngineConfig::default());

    let ticket = rig.orchestrator.submit(full_run()).unwrap();
    assert_eq!(ticket.total, 3);
    assert!(ticket.workers >= 1);
    let batch_id = ticket.batch_id.clone();
    ticket.wait();

    let state = rig.orchestrator.state();
    let snap = state.snapshot();
    assert_eq!(snap.batch_id, batch_id);
    assert!(!snap.active);
    assert!(snap.is_terminal());
    assert_eq!(snap.completed, 3);
    assert_eq!(snap.failed, 0);
    assert!(snap.has_results);

    let results = state.take_results();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.final_stage.is_some()));
}

#[test]
fn per_item_failures_do_not_abort_the_batch() {
    let rig = rig(4, Script::default().fail("img2"), EngineConfig::default());

    rig.orchestrator.submit(full_run()).unwrap().wait();

    let snap = rig.orchestrator.state().snapshot();
    assert_eq!(snap.completed, 3);
    assert_eq!(snap.failed, 1);
    let failed = snap
        .progress
        .iter()
        .find(|p| p.status == ItemStatus::Failed)
        .unwrap();
    assert_eq!(failed.filename, "img2.png");
    assert!(failed.error.as_deref().unwrap().contains("scripted failure"));
}

#[test]
fn second_submission_gets_a_conflict() {
    let rig = rig(
        2,
        Script::default()
            .delay("img0", Duration::from_millis(300))
            .delay("img1", Duration::from_millis(300)),
        EngineConfig::default(),
    );

    let ticket = rig.orchestrator.submit(full_run()).unwrap();
    let err = rig.orchestrator.submit(full_run()).unwrap_err();
    match &err {
        EngineError::BatchActive { batch_id } => assert_eq!(*batch_id, ticket.batch_id),
        other => panic!("expected BatchActive, got {other}"),
    }
    assert!(err.is_conflict());

    // The rejected submission must not have disturbed the running batch
    let snap = rig.orchestrator.state().snapshot();
    assert_eq!(snap.batch_id, ticket.batch_id);
    assert_eq!(snap.total, 2);

    ticket.wait();

    // Once drained, admission reopens
    let second = rig.orchestrator.submit(full_run()).unwrap();
    second.wait();
    assert_eq!(rig.orchestrator.state().snapshot().completed, 2);
}

#[test]
fn stuck_item_times_out_and_late_result_is_discarded() {
    let config = EngineConfig {
        item_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    };
    let rig = rig(
        5,
        Script::default().delay("img3", Duration::from_secs(2)),
        config,
    );

    let mut request = full_run();
    // One worker per item so the stuck one cannot block the others
    request.workers = Some(5);
    rig.orchestrator.submit(request).unwrap().wait();

    let snap = rig.orchestrator.state().snapshot();
    assert!(!snap.active);
    assert!(snap.is_terminal());
    assert_eq!(snap.completed, 4);
    assert_eq!(snap.failed, 1);

    let stuck = snap.progress.iter().find(|p| p.index == 3).unwrap();
    assert_eq!(stuck.status, ItemStatus::Failed);
    let reason = stuck.error.as_deref().unwrap();
    assert!(reason.contains("timed out"));
    // Sub-second timeouts must not render as "0 seconds"
    assert!(reason.contains("200ms"));

    // The worker finished long after the deadline; its late result must
    // not flip the item or bump any counter
    let after = rig.orchestrator.state().snapshot();
    assert_eq!(after.completed, 4);
    assert_eq!(after.failed, 1);
    assert_eq!(rig.orchestrator.state().take_results().len(), 4);
}

#[test]
fn queue_wait_does_not_count_against_an_item_deadline() {
    let config = EngineConfig {
        item_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    };
    let rig = rig(
        2,
        Script::default().delay("img0", Duration::from_millis(300)),
        config,
    );

    // A single worker forces img1 to sit in the queue for the whole of
    // img0's overrun; only its own execution time may hit the deadline
    let mut request = full_run();
    request.workers = Some(1);
    rig.orchestrator.submit(request).unwrap().wait();

    let snap = rig.orchestrator.state().snapshot();
    assert!(snap.is_terminal());
    assert_eq!(snap.completed, 1);
    assert_eq!(snap.failed, 1);

    let slow = snap.progress.iter().find(|p| p.index == 0).unwrap();
    assert_eq!(slow.status, ItemStatus::Failed);
    assert!(slow.error.as_deref().unwrap().contains("timed out"));

    let queued = snap.progress.iter().find(|p| p.index == 1).unwrap();
    assert_eq!(queued.status, ItemStatus::Completed);
    assert_eq!(queued.error, None);
}

#[test]
fn validation_rejects_before_anything_starts() {
    let rig = rig(2, Script::default(), EngineConfig::default());

    let mut bad_method = full_run();
    bad_method.method = "ridge".to_string();
    assert!(matches!(
        rig.orchestrator.submit(bad_method),
        Err(EngineError::InvalidMethod(_))
    ));

    let mut no_stages = full_run();
    no_stages.stages = StageFlags::default();
    assert!(matches!(
        rig.orchestrator.submit(no_stages),
        Err(EngineError::InvalidSettings(_))
    ));

    let mut bad_indices = full_run();
    bad_indices.indices = Some(vec![7, 8]);
    assert!(matches!(
        rig.orchestrator.submit(bad_indices),
        Err(EngineError::NoValidIndices)
    ));

    // Nothing was admitted by any of the rejected requests
    assert!(!rig.orchestrator.state().is_active());
    assert_eq!(rig.orchestrator.state().snapshot().total, 0);
}

#[test]
fn empty_registry_is_rejected() {
    let rig = rig(0, Script::default(), EngineConfig::default());
    assert!(matches!(
        rig.orchestrator.submit(full_run()),
        Err(EngineError::NoImages)
    ));
}

#[test]
fn out_of_range_indices_are_dropped_not_fatal() {
    let rig = rig(3, Script::default(), EngineConfig::default());

    let mut request = full_run();
    request.indices = Some(vec![0, 9, 2]);
    let ticket = rig.orchestrator.submit(request).unwrap();
    assert_eq!(ticket.total, 2);
    ticket.wait();

    let snap = rig.orchestrator.state().snapshot();
    assert_eq!(snap.completed, 2);
    let indices: Vec<_> = snap.progress.iter().map(|p| p.index).collect();
    assert_eq!(indices, [0, 2]);
}

#[test]
fn run_single_stores_the_model_only_with_cc() {
    let rig = rig(2, Script::default(), EngineConfig::default());

    let gc_only = StageFlags {
        gc: true,
        ..Default::default()
    };
    rig.orchestrator.run_single(0, gc_only, "pls").unwrap();
    assert!(!rig.registry.has_trained_model());

    let with_cc = StageFlags {
        cc: true,
        ..Default::default()
    };
    let summary = rig.orchestrator.run_single(0, with_cc, "pls").unwrap();
    assert_eq!(summary.filename, "img0.png");
    assert!(rig.registry.has_trained_model());

    assert!(matches!(
        rig.orchestrator.run_single(9, with_cc, "pls"),
        Err(EngineError::InvalidIndex(9))
    ));
}

#[test]
fn run_single_failure_leaves_no_model_behind() {
    let rig = rig(1, Script::default().fail("img0"), EngineConfig::default());

    let with_cc = StageFlags {
        cc: true,
        ..Default::default()
    };
    let err = rig.orchestrator.run_single(0, with_cc, "pls").unwrap_err();
    assert!(matches!(err, EngineError::Processing(_)));
    assert!(!rig.registry.has_trained_model());
}

#[test]
fn apply_model_requires_a_trained_model() {
    let rig = rig(2, Script::default(), EngineConfig::default());
    assert!(matches!(
        rig.orchestrator.apply_model(None, None),
        Err(EngineError::NoTrainedModel)
    ));
}

#[test]
fn shared_model_inference_never_overlaps() {
    let rig = rig(
        4,
        Script {
            predict_delay: Duration::from_millis(50),
            ..Script::default()
        },
        EngineConfig::default(),
    );

    let with_cc = StageFlags {
        cc: true,
        ..Default::default()
    };
    rig.orchestrator.run_single(0, with_cc, "pls").unwrap();

    // Ask for more workers than the lock will ever let run at once
    let ticket = rig.orchestrator.apply_model(None, Some(4)).unwrap();
    assert_eq!(ticket.workers, 4);
    ticket.wait();

    let snap = rig.orchestrator.state().snapshot();
    assert_eq!(snap.completed, 4);
    assert_eq!(snap.failed, 0);
    assert_eq!(rig.script.max_concurrent_predicts.load(Ordering::SeqCst), 1);
}

#[test]
fn shutdown_drains_an_active_batch_and_releases_once() {
    let config = EngineConfig {
        drain_timeout: Duration::from_secs(5),
        drain_poll_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    let rig = rig(
        2,
        Script::default()
            .delay("img0", Duration::from_millis(150))
            .delay("img1", Duration::from_millis(150)),
        config.clone(),
    );

    let ticket = rig.orchestrator.submit(full_run()).unwrap();

    let coordinator = Arc::new(ShutdownCoordinator::new(rig.orchestrator.state(), config));
    let released = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&released);
    coordinator.on_release(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(coordinator.request_shutdown());
    assert!(!coordinator.request_shutdown());
    assert_eq!(released.load(Ordering::SeqCst), 1);

    // The drain waited for real completion rather than forcing
    ticket.wait();
    let snap = rig.orchestrator.state().snapshot();
    assert!(!snap.active);
    assert_eq!(snap.completed, 2);
}
