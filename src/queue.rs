//! Bounded per-source capture queue.
//!
//! Capture callbacks fire on hardware-driven threads and push freshly captured
//! frames here; exactly one consumer loop per source drains the queue in FIFO
//! order. Capacity is fixed at construction and overflow sheds the oldest
//! entry, so memory stays bounded under sustained backpressure.
//!
//! The queue is pure transport:
//! - entries are single-owner until dequeued
//! - an evicted frame's ownership transfers back to the pusher, which must
//!   release it through the store if it was already tracked there
//! - loss is acceptable, unbounded growth is not
//!
//! `pop_blocking` parks on a condvar with a timeout rather than spinning, so
//! an idle consumer thread costs nothing between frames.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Number of evict-and-retry attempts before a push reports failure.
const PUSH_EVICT_ATTEMPTS: usize = 2;

/// Outcome of a [`SourceQueue::push`].
///
/// Ownership of every frame the queue shed to make room comes back to the
/// caller in `evicted`; a rejected push also returns the offered frame.
pub struct PushResult<T> {
    pub accepted: bool,
    pub evicted: Vec<T>,
    pub rejected: Option<T>,
}

impl<T> PushResult<T> {
    fn accepted(evicted: Vec<T>) -> Self {
        Self {
            accepted: true,
            evicted,
            rejected: None,
        }
    }

    fn rejected(frame: T, evicted: Vec<T>) -> Self {
        Self {
            accepted: false,
            evicted,
            rejected: Some(frame),
        }
    }
}

struct Inner<T> {
    items: VecDeque<T>,
}

/// Bounded multi-producer / single-consumer frame buffer for one source.
pub struct SourceQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> SourceQueue<T> {
    /// Create a queue with a fixed capacity. Capacity 0 is pinned to 1 so a
    /// push can always make progress by evicting.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
            }),
            available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Enqueue a frame, evicting the oldest entry when full.
    ///
    /// On overflow the queue sheds one entry and retries, up to
    /// `PUSH_EVICT_ATTEMPTS` times, before giving the offered frame back.
    pub fn push(&self, frame: T) -> PushResult<T> {
        let mut evicted = Vec::new();
        let mut guard = self.inner.lock();
        let mut attempts = 0;
        while guard.items.len() >= self.capacity {
            if attempts >= PUSH_EVICT_ATTEMPTS {
                drop(guard);
                return PushResult::rejected(frame, evicted);
            }
            if let Some(old) = guard.items.pop_front() {
                evicted.push(old);
            }
            attempts += 1;
        }
        guard.items.push_back(frame);
        drop(guard);
        self.available.notify_one();
        PushResult::accepted(evicted)
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Dequeue, waiting up to `timeout` for an item to arrive.
    pub fn pop_blocking(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock();
        loop {
            if let Some(item) = guard.items.pop_front() {
                return Some(item);
            }
            if self.available.wait_until(&mut guard, deadline).timed_out() {
                return guard.items.pop_front();
            }
        }
    }

    /// Remove and return everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut guard = self.inner.lock();
        guard.items.drain(..).collect()
    }

    /// Drop everything currently queued.
    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }
}
