//! Stage routing for newly ingested frames.
//!
//! The router consumes batches of frame references made ready by ingestion
//! and, per source, decides which stages see each frame:
//! - detection first: the rarer, heavier, authoritative stage must not be
//!   starved by a continuously busy tracker
//! - tracking only when detection did not claim the frame
//! - rendering independently of both; a frame skipped by vision processing
//!   may still need to be displayed
//!
//! Every forward is a non-blocking try-accept against a bounded stage queue;
//! rejection is backpressure, not an error. Frames nobody claimed are deleted
//! according to the source's drop policy so unconsumed work never accumulates.
//!
//! Latches are set immediately before the forward and rolled back on
//! rejection, so a stage can never observe a frame whose latch is not yet
//! held on its behalf.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::frame::{FrameKey, SourceId, StageKind};
use crate::stage::Stage;
use crate::store::FrameStore;

/// One logical unit of newly ready frames: a single source's frame, or a
/// correlated source pair sharing one dispatch decision.
#[derive(Clone, Copy, Debug)]
pub struct ReadyUnit {
    first: FrameKey,
    second: Option<FrameKey>,
}

impl ReadyUnit {
    pub fn mono(key: FrameKey) -> Self {
        Self {
            first: key,
            second: None,
        }
    }

    pub fn pair(first: FrameKey, second: FrameKey) -> Self {
        Self {
            first,
            second: Some(second),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = FrameKey> + '_ {
        std::iter::once(self.first).chain(self.second)
    }
}

/// Per-source static stage configuration.
///
/// `drop_unclaimed` decides the fate of frames no stage accepted: delete
/// immediately, or keep them for a later explicit delete by the owner.
#[derive(Default)]
pub struct RouterBinding {
    pub detector: Option<Arc<dyn Stage>>,
    pub tracker: Option<Arc<dyn Stage>>,
    pub renderer: Option<Arc<dyn Stage>>,
    pub drop_unclaimed: bool,
}

/// Routed/dropped tallies for one source, reset when the source is
/// (re)registered with a new router.
#[derive(Default)]
struct SourceStats {
    detect: AtomicU64,
    track: AtomicU64,
    render: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of a source's routing tallies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub detect: u64,
    pub track: u64,
    pub render: u64,
    pub dropped: u64,
}

struct Bound {
    binding: RouterBinding,
    stats: SourceStats,
}

/// Routes ready frames to bound stages. The binding table is fixed at
/// construction; dispatch is safe to call concurrently from every per-source
/// consumer loop.
pub struct Router {
    store: Arc<FrameStore>,
    bindings: HashMap<SourceId, Bound>,
}

impl Router {
    pub fn new(store: Arc<FrameStore>, bindings: HashMap<SourceId, RouterBinding>) -> Self {
        let bindings = bindings
            .into_iter()
            .map(|(source, binding)| {
                (
                    source,
                    Bound {
                        binding,
                        stats: SourceStats::default(),
                    },
                )
            })
            .collect();
        Self { store, bindings }
    }

    pub fn is_bound(&self, source: SourceId) -> bool {
        self.bindings.contains_key(&source)
    }

    pub fn stats(&self, source: SourceId) -> Option<RouteStats> {
        self.bindings.get(&source).map(|b| RouteStats {
            detect: b.stats.detect.load(Ordering::Relaxed),
            track: b.stats.track.load(Ordering::Relaxed),
            render: b.stats.render.load(Ordering::Relaxed),
            dropped: b.stats.dropped.load(Ordering::Relaxed),
        })
    }

    /// Route every frame in the batch. Never blocks.
    pub fn dispatch(&self, batch: &[ReadyUnit]) {
        for unit in batch {
            for key in unit.keys() {
                self.route_one(key);
            }
        }
    }

    fn route_one(&self, key: FrameKey) {
        let Some(bound) = self.bindings.get(&key.source) else {
            log::debug!("no binding for source {}, frame left in store", key.source);
            return;
        };
        // A miss means the frame was reclaimed between ingestion and routing.
        let Some(frame) = self.store.lookup(key.source, key.sequence) else {
            return;
        };

        let binding = &bound.binding;
        let stats = &bound.stats;
        let mut claimed = false;

        if let Some(detector) = &binding.detector {
            if !detector.is_busy() && frame.latches.try_claim(StageKind::Detect) {
                if detector.try_accept(key) {
                    stats.detect.fetch_add(1, Ordering::Relaxed);
                    claimed = true;
                } else {
                    frame.latches.release(StageKind::Detect);
                }
            }
        }

        // Detection takes priority; a detected frame is never also tracked.
        if !claimed {
            if let Some(tracker) = &binding.tracker {
                if !tracker.is_busy() && frame.latches.try_claim(StageKind::Track) {
                    if tracker.try_accept(key) {
                        stats.track.fetch_add(1, Ordering::Relaxed);
                        claimed = true;
                    } else {
                        frame.latches.release(StageKind::Track);
                    }
                }
            }
        }

        match &binding.renderer {
            Some(renderer) => {
                if frame.latches.try_claim(StageKind::Render) {
                    if renderer.try_accept(key) {
                        stats.render.fetch_add(1, Ordering::Relaxed);
                    } else {
                        frame.latches.release(StageKind::Render);
                        if !claimed {
                            // Nothing will consume this frame.
                            stats.dropped.fetch_add(1, Ordering::Relaxed);
                            drop(frame);
                            self.store.try_delete(key.source, key.sequence);
                        }
                    }
                }
            }
            None => {
                if !claimed && binding.drop_unclaimed {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    drop(frame);
                    self.store.try_delete(key.source, key.sequence);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FramePayload, FrameRecord};
    use std::sync::atomic::AtomicBool;

    /// Stage with scriptable busy state that remembers what it accepted.
    struct ScriptedStage {
        busy: AtomicBool,
        accept: bool,
        seen: parking_lot::Mutex<Vec<FrameKey>>,
    }

    impl ScriptedStage {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                busy: AtomicBool::new(false),
                accept,
                seen: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn set_busy(&self, busy: bool) {
            self.busy.store(busy, Ordering::SeqCst);
        }

        fn seen(&self) -> Vec<FrameKey> {
            self.seen.lock().clone()
        }
    }

    impl Stage for ScriptedStage {
        fn is_busy(&self) -> bool {
            self.busy.load(Ordering::SeqCst)
        }

        fn try_accept(&self, key: FrameKey) -> bool {
            if self.accept {
                self.seen.lock().push(key);
            }
            self.accept
        }
    }

    fn insert(store: &FrameStore, source: SourceId) -> FrameKey {
        let seq = store.insert(
            source,
            FrameRecord::new(source, 64, 64, FramePayload::new(vec![0u8; 4])),
        );
        FrameKey::new(source, seq)
    }

    fn router_for(
        store: &Arc<FrameStore>,
        source: SourceId,
        binding: RouterBinding,
    ) -> Router {
        let mut bindings = HashMap::new();
        bindings.insert(source, binding);
        Router::new(store.clone(), bindings)
    }

    #[test]
    fn idle_detector_claims_frame_and_suppresses_tracker() {
        let store = Arc::new(FrameStore::new());
        let detector = ScriptedStage::new(true);
        let tracker = ScriptedStage::new(true);
        let router = router_for(
            &store,
            1,
            RouterBinding {
                detector: Some(detector.clone()),
                tracker: Some(tracker.clone()),
                renderer: None,
                drop_unclaimed: true,
            },
        );

        let key = insert(&store, 1);
        router.dispatch(&[ReadyUnit::mono(key)]);

        assert_eq!(detector.seen(), vec![key]);
        assert!(tracker.seen().is_empty());
        let frame = store.lookup(key.source, key.sequence).unwrap();
        assert!(frame.latches.is_set(StageKind::Detect));
        assert!(!frame.latches.is_set(StageKind::Track));
        assert_eq!(router.stats(1).unwrap().detect, 1);
    }

    #[test]
    fn busy_detector_falls_through_to_tracker() {
        let store = Arc::new(FrameStore::new());
        let detector = ScriptedStage::new(true);
        let tracker = ScriptedStage::new(true);
        detector.set_busy(true);
        let router = router_for(
            &store,
            1,
            RouterBinding {
                detector: Some(detector.clone()),
                tracker: Some(tracker.clone()),
                renderer: None,
                drop_unclaimed: true,
            },
        );

        let key = insert(&store, 1);
        router.dispatch(&[ReadyUnit::mono(key)]);

        assert!(detector.seen().is_empty());
        assert_eq!(tracker.seen(), vec![key]);
        let frame = store.lookup(key.source, key.sequence).unwrap();
        assert!(frame.latches.is_set(StageKind::Track));
    }

    #[test]
    fn detector_rejection_rolls_back_latch_and_defers_to_tracker() {
        let store = Arc::new(FrameStore::new());
        let detector = ScriptedStage::new(false);
        let tracker = ScriptedStage::new(true);
        let router = router_for(
            &store,
            1,
            RouterBinding {
                detector: Some(detector),
                tracker: Some(tracker.clone()),
                renderer: None,
                drop_unclaimed: true,
            },
        );

        let key = insert(&store, 1);
        router.dispatch(&[ReadyUnit::mono(key)]);

        assert_eq!(tracker.seen(), vec![key]);
        let frame = store.lookup(key.source, key.sequence).unwrap();
        assert!(!frame.latches.is_set(StageKind::Detect));
        assert!(frame.latches.is_set(StageKind::Track));
    }

    #[test]
    fn render_runs_independently_of_detection() {
        let store = Arc::new(FrameStore::new());
        let detector = ScriptedStage::new(true);
        let renderer = ScriptedStage::new(true);
        let router = router_for(
            &store,
            1,
            RouterBinding {
                detector: Some(detector.clone()),
                tracker: None,
                renderer: Some(renderer.clone()),
                drop_unclaimed: false,
            },
        );

        let key = insert(&store, 1);
        router.dispatch(&[ReadyUnit::mono(key)]);

        assert_eq!(detector.seen(), vec![key]);
        assert_eq!(renderer.seen(), vec![key]);
        let frame = store.lookup(key.source, key.sequence).unwrap();
        assert!(frame.latches.is_set(StageKind::Detect));
        assert!(frame.latches.is_set(StageKind::Render));
    }

    #[test]
    fn render_rejection_drops_only_unclaimed_frames() {
        let store = Arc::new(FrameStore::new());
        let renderer = ScriptedStage::new(false);
        let router = router_for(
            &store,
            1,
            RouterBinding {
                detector: None,
                tracker: None,
                renderer: Some(renderer),
                drop_unclaimed: false,
            },
        );

        let key = insert(&store, 1);
        router.dispatch(&[ReadyUnit::mono(key)]);
        assert!(!store.has(key.source, key.sequence));
        assert_eq!(router.stats(1).unwrap().dropped, 1);
    }

    #[test]
    fn render_rejection_keeps_detected_frames() {
        let store = Arc::new(FrameStore::new());
        let detector = ScriptedStage::new(true);
        let renderer = ScriptedStage::new(false);
        let router = router_for(
            &store,
            1,
            RouterBinding {
                detector: Some(detector),
                tracker: None,
                renderer: Some(renderer),
                drop_unclaimed: false,
            },
        );

        let key = insert(&store, 1);
        router.dispatch(&[ReadyUnit::mono(key)]);
        // Claimed by detection; render backpressure must not reclaim it.
        assert!(store.has(key.source, key.sequence));
    }

    #[test]
    fn unclaimed_frame_honors_drop_policy() {
        let store = Arc::new(FrameStore::new());
        let keep = router_for(&store, 1, RouterBinding::default());
        let key = insert(&store, 1);
        keep.dispatch(&[ReadyUnit::mono(key)]);
        assert!(store.has(key.source, key.sequence));

        let drop_it = router_for(
            &store,
            1,
            RouterBinding {
                drop_unclaimed: true,
                ..RouterBinding::default()
            },
        );
        drop_it.dispatch(&[ReadyUnit::mono(key)]);
        assert!(!store.has(key.source, key.sequence));
    }

    #[test]
    fn reclaimed_frames_are_skipped() {
        let store = Arc::new(FrameStore::new());
        let detector = ScriptedStage::new(true);
        let router = router_for(
            &store,
            1,
            RouterBinding {
                detector: Some(detector.clone()),
                ..RouterBinding::default()
            },
        );

        let key = insert(&store, 1);
        assert!(store.try_delete(key.source, key.sequence));
        router.dispatch(&[ReadyUnit::mono(key)]);
        assert!(detector.seen().is_empty());
    }

    #[test]
    fn pair_units_route_both_sides() {
        let store = Arc::new(FrameStore::new());
        let det_a = ScriptedStage::new(true);
        let det_b = ScriptedStage::new(true);
        let mut bindings = HashMap::new();
        bindings.insert(
            10,
            RouterBinding {
                detector: Some(det_a.clone() as Arc<dyn Stage>),
                ..RouterBinding::default()
            },
        );
        bindings.insert(
            11,
            RouterBinding {
                detector: Some(det_b.clone() as Arc<dyn Stage>),
                ..RouterBinding::default()
            },
        );
        let router = Router::new(store.clone(), bindings);

        let a = insert(&store, 10);
        let b = insert(&store, 11);
        router.dispatch(&[ReadyUnit::pair(a, b)]);
        assert_eq!(det_a.seen(), vec![a]);
        assert_eq!(det_b.seen(), vec![b]);
    }
}
