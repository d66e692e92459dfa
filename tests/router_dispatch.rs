//! Dispatch behavior against live stage workers: priority order, fallthrough,
//! drop policy, and latch-gated reclamation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use frame_kernel::{
    simulated_workload, FramePayload, FrameRecord, FrameStore, NullStage, ReadyUnit, RenderGate,
    Router, RouterBinding, StageKind, StageWorker, TerminateFlag,
};

fn frame(source: u64) -> FrameRecord {
    FrameRecord::new(source, 64, 48, FramePayload::new(vec![0u8; 64 * 48]))
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn worker(
    name: &str,
    kind: StageKind,
    store: &Arc<FrameStore>,
    terminate: &TerminateFlag,
    gate: Option<Arc<RenderGate>>,
) -> StageWorker {
    StageWorker::spawn(
        name,
        kind,
        1,
        store.clone(),
        terminate.clone(),
        gate,
        simulated_workload(Duration::from_millis(2)),
    )
    .expect("spawn worker")
}

#[test]
fn detector_takes_priority_over_tracker() {
    let store = Arc::new(FrameStore::new());
    let terminate = TerminateFlag::new();
    let detect = worker("detect", StageKind::Detect, &store, &terminate, None);
    let track = worker("track", StageKind::Track, &store, &terminate, None);

    let mut bindings = HashMap::new();
    bindings.insert(
        1,
        RouterBinding {
            detector: Some(detect.input()),
            tracker: Some(track.input()),
            renderer: None,
            drop_unclaimed: false,
        },
    );
    let router = Router::new(store.clone(), bindings);

    let seq = store.insert(1, frame(1));
    router.dispatch(&[ReadyUnit::mono(frame_kernel::FrameKey::new(1, seq))]);

    // The detect worker releases its latch and reclaims the frame.
    assert!(wait_until(Duration::from_secs(2), || store.is_empty()));
    let stats = router.stats(1).unwrap();
    assert_eq!(stats.detect, 1);
    assert_eq!(stats.track, 0);

    terminate.set();
    detect.join();
    track.join();
}

#[test]
fn rejected_detector_falls_through_to_tracker() {
    let store = Arc::new(FrameStore::new());
    let terminate = TerminateFlag::new();
    let detect = Arc::new(NullStage::rejecting());
    let track = worker("track", StageKind::Track, &store, &terminate, None);

    let mut bindings = HashMap::new();
    bindings.insert(
        1,
        RouterBinding {
            detector: Some(detect.clone()),
            tracker: Some(track.input()),
            renderer: None,
            drop_unclaimed: false,
        },
    );
    let router = Router::new(store.clone(), bindings);

    let seq = store.insert(1, frame(1));
    router.dispatch(&[ReadyUnit::mono(frame_kernel::FrameKey::new(1, seq))]);

    assert!(wait_until(Duration::from_secs(2), || store.is_empty()));
    let stats = router.stats(1).unwrap();
    assert_eq!(stats.detect, 0);
    assert_eq!(stats.track, 1);
    assert_eq!(detect.offered(), 1);

    terminate.set();
    track.join();
}

#[test]
fn render_runs_alongside_detection() {
    let store = Arc::new(FrameStore::new());
    let terminate = TerminateFlag::new();
    let gate = Arc::new(RenderGate::new());
    let detect = worker("detect", StageKind::Detect, &store, &terminate, None);
    let render = worker(
        "render",
        StageKind::Render,
        &store,
        &terminate,
        Some(gate.clone()),
    );

    let mut bindings = HashMap::new();
    bindings.insert(
        1,
        RouterBinding {
            detector: Some(detect.input()),
            tracker: None,
            renderer: Some(render.input()),
            drop_unclaimed: false,
        },
    );
    let router = Router::new(store.clone(), bindings);

    let seq = store.insert(1, frame(1));
    router.dispatch(&[ReadyUnit::mono(frame_kernel::FrameKey::new(1, seq))]);

    // Deletion only succeeds after BOTH stages release their latches.
    assert!(wait_until(Duration::from_secs(2), || store.is_empty()));
    let stats = router.stats(1).unwrap();
    assert_eq!(stats.detect, 1);
    assert_eq!(stats.render, 1);
    assert!(!gate.is_active());

    terminate.set();
    detect.join();
    render.join();
}

#[test]
fn unclaimed_frame_is_dropped_under_drop_policy() {
    let store = Arc::new(FrameStore::new());

    let mut bindings = HashMap::new();
    bindings.insert(
        1,
        RouterBinding {
            detector: Some(Arc::new(NullStage::rejecting())),
            tracker: None,
            renderer: None,
            drop_unclaimed: true,
        },
    );
    let router = Router::new(store.clone(), bindings);

    let seq = store.insert(1, frame(1));
    router.dispatch(&[ReadyUnit::mono(frame_kernel::FrameKey::new(1, seq))]);

    assert!(store.is_empty());
    assert_eq!(router.stats(1).unwrap().dropped, 1);
}

#[test]
fn unclaimed_frame_survives_without_drop_policy() {
    let store = Arc::new(FrameStore::new());

    let mut bindings = HashMap::new();
    bindings.insert(
        1,
        RouterBinding {
            detector: Some(Arc::new(NullStage::rejecting())),
            tracker: None,
            renderer: None,
            drop_unclaimed: false,
        },
    );
    let router = Router::new(store.clone(), bindings);

    let seq = store.insert(1, frame(1));
    router.dispatch(&[ReadyUnit::mono(frame_kernel::FrameKey::new(1, seq))]);

    // The owner decides later; the router must leave it alone.
    assert!(store.has(1, seq));
    assert_eq!(router.stats(1).unwrap().dropped, 0);
}

#[test]
fn stereo_pair_is_reclaimed_and_unlinked() {
    let store = Arc::new(FrameStore::new());
    let terminate = TerminateFlag::new();
    let detect = worker("detect", StageKind::Detect, &store, &terminate, None);

    let mut bindings = HashMap::new();
    for source in [1u64, 2u64] {
        bindings.insert(
            source,
            RouterBinding {
                detector: Some(detect.input()),
                tracker: None,
                renderer: None,
                drop_unclaimed: true,
            },
        );
    }
    let router = Router::new(store.clone(), bindings);

    let seq = store.insert_stereo(1, frame(1), 2, frame(2));
    let left = frame_kernel::FrameKey::new(1, seq);
    let right = frame_kernel::FrameKey::new(2, seq);
    store.stereo().link(left, right);

    router.dispatch(&[ReadyUnit::pair(left, right)]);

    // Whichever side goes first cascades into its twin once the twin's
    // latches clear, and the correlation link dies with the first delete.
    assert!(wait_until(Duration::from_secs(2), || store.is_empty()));
    assert!(store.stereo().is_empty());

    terminate.set();
    detect.join();
}

#[test]
fn dispatch_skips_frames_already_reclaimed() {
    let store = Arc::new(FrameStore::new());

    let mut bindings = HashMap::new();
    bindings.insert(
        1,
        RouterBinding {
            detector: Some(Arc::new(NullStage::accepting())),
            tracker: None,
            renderer: None,
            drop_unclaimed: true,
        },
    );
    let router = Router::new(store.clone(), bindings);

    let seq = store.insert(1, frame(1));
    assert!(store.try_delete(1, seq));

    // Stale key: nothing routed, nothing counted.
    router.dispatch(&[ReadyUnit::mono(frame_kernel::FrameKey::new(1, seq))]);
    let stats = router.stats(1).unwrap();
    assert_eq!(stats.detect + stats.track + stats.render + stats.dropped, 0);
}
