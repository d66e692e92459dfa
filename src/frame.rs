//! Frame records and stage latches.
//!
//! A `FrameRecord` is one captured sample in flight between ingestion and
//! reclamation. It exclusively owns its payload from the moment the capture
//! layer hands it over until the record itself is dropped.
//!
//! Stage occupancy is tracked by three latches packed into one atomic bitset:
//! - `Detect` and `Track` are mutually exclusive (a frame selected for
//!   detection is never simultaneously tracked)
//! - `Render` is independent and may coexist with either
//!
//! The latches gate deletion from the [`FrameStore`](crate::FrameStore): an
//! entry is only removed while all three are clear. Shared access uses
//! reference-counted handles, so a stage that still holds a handle keeps the
//! payload alive after the table slot is gone.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Identifier for a logical frame producer (one camera, one sensor feed).
pub type SourceId = u64;

/// Composite key addressing one frame: `(source, sequence)`.
///
/// Used directly as the table key rather than a derived hash of the pair, so
/// two distinct frames can never collide into one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub source: SourceId,
    pub sequence: u64,
}

impl FrameKey {
    pub fn new(source: SourceId, sequence: u64) -> Self {
        Self { source, sequence }
    }
}

/// Shared, reference-counted handle to an in-flight frame.
pub type FrameHandle = Arc<FrameRecord>;

// ----------------------------------------------------------------------------
// Stage latches
// ----------------------------------------------------------------------------

const DETECTING: u8 = 0b001;
const TRACKING: u8 = 0b010;
const RENDERING: u8 = 0b100;

/// The three frame-consuming stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    Detect,
    Track,
    Render,
}

impl StageKind {
    fn bit(self) -> u8 {
        match self {
            StageKind::Detect => DETECTING,
            StageKind::Track => TRACKING,
            StageKind::Render => RENDERING,
        }
    }

    /// Latches that must be clear before this stage may claim the frame.
    /// Detect and Track exclude each other; Render only excludes itself.
    fn conflicts(self) -> u8 {
        match self {
            StageKind::Detect => DETECTING | TRACKING,
            StageKind::Track => DETECTING | TRACKING,
            StageKind::Render => RENDERING,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Detect => "detect",
            StageKind::Track => "track",
            StageKind::Render => "render",
        }
    }
}

/// Atomic bitset of the three stage latches.
///
/// All transitions are compare-and-swap, so claim, release and the idle check
/// used by deletion interleave safely without external locking.
#[derive(Debug, Default)]
pub struct StageLatches {
    bits: AtomicU8,
}

impl StageLatches {
    pub fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
        }
    }

    /// Set the latch for `stage`. Fails if a conflicting latch is already set.
    pub fn try_claim(&self, stage: StageKind) -> bool {
        let bit = stage.bit();
        let conflicts = stage.conflicts();
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            if current & conflicts != 0 {
                return false;
            }
            match self.bits.compare_exchange_weak(
                current,
                current | bit,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Clear the latch for `stage`. Returns whether it was actually set;
    /// clearing an unset latch is a contract violation by the caller and is
    /// treated as a no-op.
    pub fn release(&self, stage: StageKind) -> bool {
        let bit = stage.bit();
        let prev = self.bits.fetch_and(!bit, Ordering::AcqRel);
        prev & bit != 0
    }

    pub fn is_set(&self, stage: StageKind) -> bool {
        self.bits.load(Ordering::Acquire) & stage.bit() != 0
    }

    /// True when no stage holds the frame; the only state deletion accepts.
    pub fn is_idle(&self) -> bool {
        self.bits.load(Ordering::Acquire) == 0
    }
}

// ----------------------------------------------------------------------------
// Payload and record
// ----------------------------------------------------------------------------

/// Opaque payload handle produced by the acquisition collaborator.
///
/// The bytes are private to the capture side: nothing in this core interprets
/// or copies them, they just travel with the record until it is reclaimed.
pub struct FramePayload {
    data: Vec<u8>,
}

impl FramePayload {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Payload size, for memory accounting in health logs.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// One captured sample in flight.
///
/// Created by the capture layer, transported single-owner through a
/// [`SourceQueue`](crate::SourceQueue), then inserted into the
/// [`FrameStore`](crate::FrameStore) which assigns the sequence number and
/// wraps it in a shared handle.
pub struct FrameRecord {
    pub source_id: SourceId,
    sequence: u64,
    tracked: bool,
    pub capture_timestamp: Instant,
    pub width: u32,
    pub height: u32,
    pub payload: FramePayload,
    pub latches: StageLatches,
}

impl FrameRecord {
    pub fn new(source_id: SourceId, width: u32, height: u32, payload: FramePayload) -> Self {
        Self {
            source_id,
            sequence: 0,
            tracked: false,
            capture_timestamp: Instant::now(),
            width,
            height,
            payload,
            latches: StageLatches::new(),
        }
    }

    /// Sequence number assigned at insertion. Meaningless until
    /// [`FrameRecord::is_tracked`] returns true.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn assign_sequence(&mut self, seq: u64) {
        self.sequence = seq;
        self.tracked = true;
    }

    /// Whether this record was ever inserted into a store. Evicted queue
    /// entries that never made it that far are simply dropped by the caller.
    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    pub fn key(&self) -> FrameKey {
        FrameKey::new(self.source_id, self.sequence)
    }

    pub fn age(&self) -> std::time::Duration {
        self.capture_timestamp.elapsed()
    }
}
