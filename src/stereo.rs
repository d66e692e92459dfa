//! Cross-source frame correlation.
//!
//! Records which frame from one source is believed to capture the same
//! real-world instant as a frame from another source (left/right camera
//! pairing), so the partner can be located and jointly reclaimed when either
//! side completes.
//!
//! The relation is symmetric and last-writer-wins: linking a key that is
//! already paired replaces its previous pairing, and at most one unresolved
//! pairing exists per key at a time. Keys are the composite `(source, seq)`
//! pair itself, never a derived hash.

use dashmap::DashMap;

use crate::frame::FrameKey;

/// Bidirectional `(source, seq) <-> (source, seq)` association table.
#[derive(Default)]
pub struct StereoCorrelator {
    links: DashMap<FrameKey, FrameKey>,
}

impl StereoCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a bidirectional association, overwriting any prior link held
    /// by either key.
    pub fn link(&self, a: FrameKey, b: FrameKey) {
        self.links.insert(a, b);
        self.links.insert(b, a);
    }

    /// The partner of `key`, if a pairing is currently recorded.
    pub fn twin_of(&self, key: FrameKey) -> Option<FrameKey> {
        self.links.get(&key).map(|entry| *entry.value())
    }

    /// Remove the pairing in both directions. Returns whether a link existed.
    pub fn unlink(&self, key: FrameKey) -> bool {
        match self.links.remove(&key) {
            Some((_, twin)) => {
                self.links.remove(&twin);
                true
            }
            None => false,
        }
    }

    /// Number of linked keys (twice the number of pairings).
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
