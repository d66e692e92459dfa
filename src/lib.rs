//! Frame Kernel
//!
//! This crate implements the concurrent core of a multi-source frame
//! processing pipeline: bounded capture queues, a shared frame store, and a
//! priority router that fans frames out to detection, tracking, and render
//! stages.
//!
//! # Architecture
//!
//! The kernel enforces a small set of invariants by construction:
//!
//! 1. **Bounded capture**: every source queue has a fixed capacity; when it
//!    is full the oldest frame is evicted, never the newest.
//! 2. **Single owner of record**: once a frame is inserted into the
//!    [`FrameStore`] it is shared behind an [`FrameHandle`] and only the
//!    store decides when it dies.
//! 3. **Gated deletion**: a frame cannot be removed while any stage latch is
//!    set; deletion requests against a busy frame fail and are retried by
//!    whichever stage clears the last latch.
//! 4. **Exclusive analysis**: detection and tracking are mutually exclusive
//!    per frame; rendering runs independently of both.
//! 5. **Single render in flight**: at most one frame renders at a time
//!    process-wide, enforced by [`RenderGate`].
//! 6. **Stereo symmetry**: correlated frame pairs share one sequence number
//!    and are unlinked exactly once, when the first side is reclaimed.
//!
//! # Module Structure
//!
//! - `frame`: frame records, composite keys, stage latches
//! - `queue`: bounded per-source capture queues with evict-oldest overflow
//! - `store`: the shared frame table and per-source sequence allocation
//! - `stereo`: bidirectional correlation links between frame twins
//! - `router`: priority dispatch of ready frames to bound stages
//! - `stage`: stage workers, the render gate, and the inline renderer
//! - `pipeline`: source registration, consumer loops, lifecycle
//! - `config`: runtime configuration (file, env, defaults)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod config;
pub mod frame;
pub mod pipeline;
pub mod queue;
pub mod router;
pub mod stage;
pub mod stereo;
pub mod store;

pub use config::{CaptureSettings, PipelineConfig, RenderMode};
pub use frame::{
    FrameHandle, FrameKey, FramePayload, FrameRecord, SourceId, StageKind, StageLatches,
};
pub use pipeline::{FeedSpec, Pipeline, PipelineBuilder};
pub use queue::{PushResult, SourceQueue};
pub use router::{ReadyUnit, RouteStats, Router, RouterBinding};
pub use stage::{
    simulated_workload, InlineRenderer, NullStage, RenderGate, Stage, StageInput, StageWorker,
};
pub use store::{FrameStore, SequenceAllocator};
pub use stereo::StereoCorrelator;

/// Shared shutdown flag, observed by every worker and consumer loop.
///
/// Cloning is cheap; all clones observe the same flag. Once set it is never
/// cleared, so loops may poll it without synchronizing on anything else.
#[derive(Clone, Debug, Default)]
pub struct TerminateFlag {
    flag: Arc<AtomicBool>,
}

impl TerminateFlag {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request shutdown. Idempotent.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
