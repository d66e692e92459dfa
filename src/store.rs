//! Concurrent in-flight frame table.
//!
//! The `FrameStore` owns every frame between ingestion and reclamation,
//! indexed by the composite `(source, sequence)` key. It is the only shared
//! structure with multi-writer access, so every mutation path here must be
//! safe to interleave without external locking:
//! - the table is sharded ([`DashMap`]), never behind one global lock
//! - no shard lock is held across stage code; `lookup` hands out a
//!   reference-counted handle and deletion removes only the table slot, the
//!   payload lives until the last handle drops
//! - `try_delete` is a single atomic check-and-remove against the latches, so
//!   a delete racing a stage's latch clear can never double-free or leave a
//!   dangling entry
//!
//! Lookup misses are a normal outcome (the frame was reclaimed concurrently)
//! and never an error. A delete refused because a latch is still set is the
//! retrying caller's cue to come back after the stage releases; it is counted
//! for diagnostics, not escalated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::frame::{FrameHandle, FrameKey, FrameRecord, SourceId};
use crate::stereo::StereoCorrelator;

// ----------------------------------------------------------------------------
// Sequence allocation
// ----------------------------------------------------------------------------

/// Issues monotonically increasing sequence numbers per source.
///
/// The first call for a never-seen source returns 0. Counters are created
/// lazily; concurrent callers for one source interleave arbitrarily but never
/// repeat a value.
#[derive(Default)]
pub struct SequenceAllocator {
    counters: DashMap<SourceId, AtomicU64>,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, source: SourceId) -> u64 {
        self.counters
            .entry(source)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Highest value issued so far, if any. Health reporting only.
    pub fn last_issued(&self, source: SourceId) -> Option<u64> {
        self.counters
            .get(&source)
            .map(|c| c.load(Ordering::Relaxed))
            .and_then(|n| n.checked_sub(1))
    }
}

// ----------------------------------------------------------------------------
// Diagnostics
// ----------------------------------------------------------------------------

/// Monotonic counters for expected-but-noteworthy outcomes. Contract bugs
/// (delete against a held latch, stale lookups under overload) surface here
/// instead of crashing the pipeline.
#[derive(Default)]
pub struct StoreCounters {
    gated_deletes: AtomicU64,
    stale_lookups: AtomicU64,
}

/// Point-in-time snapshot of [`StoreCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreCountersSnapshot {
    pub gated_deletes: u64,
    pub stale_lookups: u64,
}

impl StoreCounters {
    fn snapshot(&self) -> StoreCountersSnapshot {
        StoreCountersSnapshot {
            gated_deletes: self.gated_deletes.load(Ordering::Relaxed),
            stale_lookups: self.stale_lookups.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Frame store
// ----------------------------------------------------------------------------

/// Concurrent keyed table owning all in-flight frames.
///
/// Constructed once and shared by `Arc` between the pipeline driver, the
/// router and every stage worker; there is no implicit global instance.
pub struct FrameStore {
    frames: DashMap<FrameKey, FrameHandle>,
    sequences: SequenceAllocator,
    stereo: StereoCorrelator,
    counters: StoreCounters,
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            frames: DashMap::new(),
            sequences: SequenceAllocator::new(),
            stereo: StereoCorrelator::new(),
            counters: StoreCounters::default(),
        }
    }

    /// Cross-source frame correlation table. The router's join step records
    /// pairings here explicitly; insertion never links implicitly.
    pub fn stereo(&self) -> &StereoCorrelator {
        &self.stereo
    }

    /// Ingest one frame: allocate its sequence number, take ownership and
    /// return the sequence.
    pub fn insert(&self, source: SourceId, mut frame: FrameRecord) -> u64 {
        let seq = self.sequences.next(source);
        frame.source_id = source;
        frame.assign_sequence(seq);
        self.frames
            .insert(FrameKey::new(source, seq), Arc::new(frame));
        seq
    }

    /// Ingest a correlated pair under one shared sequence number spanning both
    /// sources. No stereo link is recorded; that is the join step's explicit
    /// call to [`StereoCorrelator::link`].
    pub fn insert_stereo(
        &self,
        source_a: SourceId,
        mut frame_a: FrameRecord,
        source_b: SourceId,
        mut frame_b: FrameRecord,
    ) -> u64 {
        let seq = self.sequences.next(source_a);
        frame_a.source_id = source_a;
        frame_a.assign_sequence(seq);
        frame_b.source_id = source_b;
        frame_b.assign_sequence(seq);
        self.frames
            .insert(FrameKey::new(source_a, seq), Arc::new(frame_a));
        self.frames
            .insert(FrameKey::new(source_b, seq), Arc::new(frame_b));
        seq
    }

    /// Shared handle to a frame, if it is still in flight. Absence means
    /// "already reclaimed or never existed" and callers must no-op.
    pub fn lookup(&self, source: SourceId, sequence: u64) -> Option<FrameHandle> {
        let found = self
            .frames
            .get(&FrameKey::new(source, sequence))
            .map(|entry| entry.value().clone());
        if found.is_none() {
            self.counters.stale_lookups.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Existence check for one source.
    pub fn has(&self, source: SourceId, sequence: u64) -> bool {
        self.frames.contains_key(&FrameKey::new(source, sequence))
    }

    /// Existence check across all sources.
    pub fn has_any(&self, sequence: u64) -> bool {
        self.frames.iter().any(|e| e.key().sequence == sequence)
    }

    /// Remove and release an entry iff all three stage latches are clear.
    ///
    /// Returns false both for an entry still held by a stage (the caller
    /// retries after the stage releases) and for a missing entry (idempotent
    /// no-op). On success the stereo twin, if linked, is also attempted under
    /// its own latch gate and the link is removed in both directions.
    pub fn try_delete(&self, source: SourceId, sequence: u64) -> bool {
        let key = FrameKey::new(source, sequence);
        if self
            .frames
            .remove_if(&key, |_, frame| frame.latches.is_idle())
            .is_none()
        {
            if self.frames.contains_key(&key) {
                self.counters.gated_deletes.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "delete deferred, stage latch still set: source={} seq={}",
                    source,
                    sequence
                );
            }
            return false;
        }
        if let Some(twin) = self.stereo.twin_of(key) {
            self.frames
                .remove_if(&twin, |_, frame| frame.latches.is_idle());
            self.stereo.unlink(key);
        }
        true
    }

    /// Force-drop every entry for a source regardless of latches. Source
    /// teardown only; in-flight handles held by stages stay valid until
    /// dropped.
    pub fn clear_all(&self, source: SourceId) {
        self.frames.retain(|key, _| key.source != source);
    }

    /// Frames currently in flight across all sources.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames currently in flight for one source.
    pub fn in_flight(&self, source: SourceId) -> usize {
        self.frames.iter().filter(|e| e.key().source == source).count()
    }

    /// Total payload bytes currently owned by the table.
    pub fn payload_bytes(&self) -> usize {
        self.frames
            .iter()
            .map(|e| e.value().payload.byte_len())
            .sum()
    }

    pub fn counters(&self) -> StoreCountersSnapshot {
        self.counters.snapshot()
    }
}
