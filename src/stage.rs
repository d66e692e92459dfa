//! Stage adapters and admission queues.
//!
//! Detection, tracking and rendering are external collaborators; the core
//! only needs their busy/available contract, captured by the [`Stage`] trait:
//! a cheap busy probe plus a non-blocking try-accept. A full admission queue
//! is a rejection, not an error — backpressure is shed by dropping frames,
//! never by blocking the router.
//!
//! [`StageWorker`] is the in-process realization of that contract: a bounded
//! depth-1/depth-2 channel feeding one worker thread. The worker looks the
//! frame up, runs the stage body, clears its own latch and makes the next
//! delete attempt — the stage that releases last is the one whose delete
//! succeeds.
//!
//! [`RenderGate`] adds the system-wide single-flight restriction for shared
//! GPU contexts: one compare-and-set boolean; a loser's frame is dropped
//! immediately rather than queued behind the winner.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::frame::{FrameHandle, FrameKey, StageKind};
use crate::store::FrameStore;
use crate::TerminateFlag;

/// How long a parked worker waits before re-checking the terminate flag.
const WORKER_POLL: Duration = Duration::from_millis(50);

/// Busy/available contract every stage collaborator exposes to the router.
pub trait Stage: Send + Sync {
    /// Whether the stage is currently occupied with a frame.
    fn is_busy(&self) -> bool;

    /// Offer a frame reference to the stage without blocking. `false` means
    /// stage-side backpressure; the caller falls through or drops.
    fn try_accept(&self, key: FrameKey) -> bool;
}

// ----------------------------------------------------------------------------
// Render admission
// ----------------------------------------------------------------------------

/// Process-wide single-flight render latch.
///
/// At most one render operation is in flight system-wide; the winner of the
/// compare-and-set proceeds and must call [`RenderGate::finish`] when done.
/// Single-threaded-render deployments bypass the gate entirely (rendering
/// happens inline in the driving loop, so concurrent renders cannot exist).
#[derive(Default)]
pub struct RenderGate {
    active: AtomicBool,
}

impl RenderGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to become the in-flight render. Loser must drop its frame.
    pub fn try_begin(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

// ----------------------------------------------------------------------------
// In-process stage worker
// ----------------------------------------------------------------------------

/// Sending half handed to the router; implements [`Stage`] over the bounded
/// admission channel.
pub struct StageInput {
    kind: StageKind,
    tx: Sender<FrameKey>,
    busy: Arc<AtomicBool>,
    accepted: AtomicU64,
}

impl Stage for StageInput {
    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn try_accept(&self, key: FrameKey) -> bool {
        let ok = self.tx.try_send(key).is_ok();
        if ok {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }
}

impl StageInput {
    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Frames accepted since construction.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

/// A spawned stage worker: the admission input plus the worker thread.
pub struct StageWorker {
    input: Arc<StageInput>,
    thread: Option<JoinHandle<()>>,
}

impl StageWorker {
    /// Spawn a worker servicing `kind` with an admission queue of `depth`
    /// (clamped to 1..=2; deeper queues would hide overload instead of
    /// shedding it).
    ///
    /// `body` runs once per accepted frame. The worker owns the rest of the
    /// lifecycle: latch release and the follow-up delete attempt.
    pub fn spawn<F>(
        name: &str,
        kind: StageKind,
        depth: usize,
        store: Arc<FrameStore>,
        terminate: TerminateFlag,
        render_gate: Option<Arc<RenderGate>>,
        mut body: F,
    ) -> anyhow::Result<Self>
    where
        F: FnMut(&FrameHandle) + Send + 'static,
    {
        debug_assert!(
            render_gate.is_none() || kind == StageKind::Render,
            "render gate only applies to render workers"
        );
        let depth = depth.clamp(1, 2);
        let (tx, rx) = bounded::<FrameKey>(depth);
        let busy = Arc::new(AtomicBool::new(false));
        let input = Arc::new(StageInput {
            kind,
            tx,
            busy: busy.clone(),
            accepted: AtomicU64::new(0),
        });
        let thread_name = format!("stage-{}", name);
        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                stage_loop(kind, rx, busy, store, terminate, render_gate, &mut body);
                log::info!("{} worker exiting", kind.name());
            })
            .map_err(|e| anyhow::anyhow!("failed to spawn {}: {}", thread_name, e))?;
        Ok(Self {
            input,
            thread: Some(thread),
        })
    }

    /// The router-facing admission handle.
    pub fn input(&self) -> Arc<StageInput> {
        self.input.clone()
    }

    /// Wait for the worker thread to observe termination and exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn stage_loop<F>(
    kind: StageKind,
    rx: Receiver<FrameKey>,
    busy: Arc<AtomicBool>,
    store: Arc<FrameStore>,
    terminate: TerminateFlag,
    render_gate: Option<Arc<RenderGate>>,
    body: &mut F,
) where
    F: FnMut(&FrameHandle),
{
    while !terminate.is_set() {
        let key = match rx.recv_timeout(WORKER_POLL) {
            Ok(key) => key,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        busy.store(true, Ordering::Release);
        process_one(kind, key, &store, render_gate.as_deref(), body);
        busy.store(false, Ordering::Release);
    }
}

fn process_one<F>(
    kind: StageKind,
    key: FrameKey,
    store: &FrameStore,
    render_gate: Option<&RenderGate>,
    body: &mut F,
) where
    F: FnMut(&FrameHandle),
{
    let Some(frame) = store.lookup(key.source, key.sequence) else {
        // Already reclaimed (teardown or overload); nothing to release.
        return;
    };
    match render_gate {
        Some(gate) if !gate.try_begin() => {
            // Lost the single-flight race; a second render cannot queue
            // behind the first, so the frame is dropped now.
            log::debug!(
                "render gate busy, dropping frame: source={} seq={}",
                key.source,
                key.sequence
            );
        }
        Some(gate) => {
            body(&frame);
            gate.finish();
        }
        None => body(&frame),
    }
    frame.latches.release(kind);
    drop(frame);
    store.try_delete(key.source, key.sequence);
}

/// Stage body that burns a fixed per-frame duration. Stand-in for real
/// detector/tracker/render work in the daemon and in benchmarks.
pub fn simulated_workload(per_frame: Duration) -> impl FnMut(&FrameHandle) + Send + 'static {
    move |_frame: &FrameHandle| {
        if !per_frame.is_zero() {
            std::thread::sleep(per_frame);
        }
    }
}

// ----------------------------------------------------------------------------
// Single-threaded render
// ----------------------------------------------------------------------------

/// Render adapter for single-threaded-render deployments.
///
/// Accepts frames into a bounded queue like any other stage, but no worker
/// thread exists: the driving loop polls one frame at a time and runs the
/// render body inline, so concurrent renders are impossible by construction
/// and the [`RenderGate`] is bypassed.
pub struct InlineRenderer {
    tx: Sender<FrameKey>,
    rx: Receiver<FrameKey>,
    store: Arc<FrameStore>,
}

impl InlineRenderer {
    pub fn new(depth: usize, store: Arc<FrameStore>) -> Self {
        let (tx, rx) = bounded(depth.clamp(1, 2));
        Self { tx, rx, store }
    }

    /// Render at most one queued frame inline. Returns whether a frame was
    /// polled; the driving loop sleeps briefly when it returns false.
    pub fn poll_one<F>(&self, mut body: F) -> bool
    where
        F: FnMut(&FrameHandle),
    {
        let Ok(key) = self.rx.try_recv() else {
            return false;
        };
        if let Some(frame) = self.store.lookup(key.source, key.sequence) {
            body(&frame);
            frame.latches.release(StageKind::Render);
            drop(frame);
            self.store.try_delete(key.source, key.sequence);
        }
        true
    }
}

impl Stage for InlineRenderer {
    fn is_busy(&self) -> bool {
        self.tx.is_full()
    }

    fn try_accept(&self, key: FrameKey) -> bool {
        self.tx.try_send(key).is_ok()
    }
}

// ----------------------------------------------------------------------------
// Null stage
// ----------------------------------------------------------------------------

/// Stage that does no work: reports never-busy and either accepts (and
/// forgets) or rejects every frame. Router wiring for sources whose frames
/// only need the drop policy applied, and scripted behavior in tests.
pub struct NullStage {
    accept: bool,
    offered: AtomicU64,
}

impl NullStage {
    pub fn accepting() -> Self {
        Self {
            accept: true,
            offered: AtomicU64::new(0),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            accept: false,
            offered: AtomicU64::new(0),
        }
    }

    pub fn offered(&self) -> u64 {
        self.offered.load(Ordering::Relaxed)
    }
}

impl Stage for NullStage {
    fn is_busy(&self) -> bool {
        false
    }

    fn try_accept(&self, _key: FrameKey) -> bool {
        self.offered.fetch_add(1, Ordering::Relaxed);
        self.accept
    }
}
