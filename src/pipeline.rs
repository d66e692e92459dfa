//! Pipeline driver: source registry, consumer loops and teardown.
//!
//! Ties the core together: each registered source gets its bounded
//! [`SourceQueue`]; each feed gets exactly one consumer thread that drains the
//! queue in pipeline order, inserts frames into the shared [`FrameStore`] and
//! hands the resulting references to the [`Router`]. Stereo feeds insert
//! pairs under one shared sequence and record the correlation before routing.
//!
//! Every loop polls the process-wide terminate flag; on observing it the
//! feeds deactivate, consumer and stage-worker threads are joined, and each
//! source is force-cleared from the store. No implicit global state: the
//! store, router and flag are constructed once and threaded through here by
//! shared reference.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::frame::{FrameKey, FrameRecord, SourceId};
use crate::queue::SourceQueue;
use crate::router::{ReadyUnit, Router, RouterBinding};
use crate::stage::StageWorker;
use crate::store::FrameStore;
use crate::TerminateFlag;

/// Default wait for a frame before a consumer re-checks the terminate flag.
pub const DEFAULT_POP_TIMEOUT: Duration = Duration::from_millis(100);

/// How a consumer loop drains its source(s).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedSpec {
    /// One source, one queue.
    Mono(SourceId),
    /// Two independent sources multiplexed into one dispatch batch, no
    /// correlation between them.
    DualMono(SourceId, SourceId),
    /// Two correlated sources joined into pairs sharing one sequence.
    Stereo(SourceId, SourceId),
}

impl FeedSpec {
    fn sources(&self) -> impl Iterator<Item = SourceId> {
        match *self {
            FeedSpec::Mono(a) => vec![a].into_iter(),
            FeedSpec::DualMono(a, b) | FeedSpec::Stereo(a, b) => vec![a, b].into_iter(),
        }
    }
}

struct SourceEntry {
    queue: Arc<SourceQueue<FrameRecord>>,
}

/// Assembles a [`Pipeline`]: register sources, declare feeds, bind stages.
pub struct PipelineBuilder {
    store: Arc<FrameStore>,
    terminate: TerminateFlag,
    max_sources: usize,
    pop_timeout: Duration,
    sources: HashMap<SourceId, SourceEntry>,
    feeds: Vec<FeedSpec>,
    bindings: HashMap<SourceId, RouterBinding>,
    workers: Vec<StageWorker>,
}

impl PipelineBuilder {
    pub fn new(store: Arc<FrameStore>, terminate: TerminateFlag, max_sources: usize) -> Self {
        Self {
            store,
            terminate,
            max_sources,
            pop_timeout: DEFAULT_POP_TIMEOUT,
            sources: HashMap::new(),
            feeds: Vec::new(),
            bindings: HashMap::new(),
            workers: Vec::new(),
        }
    }

    pub fn pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    /// Register a source and create its capture queue. Registering an id a
    /// second time is idempotent and keeps the existing queue.
    pub fn source(mut self, id: SourceId, queue_capacity: usize) -> Result<Self> {
        if self.sources.contains_key(&id) {
            return Ok(self);
        }
        if self.sources.len() >= self.max_sources {
            bail!(
                "source limit reached: {} sources configured, max_sources={}",
                self.sources.len(),
                self.max_sources
            );
        }
        self.sources.insert(
            id,
            SourceEntry {
                queue: Arc::new(SourceQueue::new(queue_capacity)),
            },
        );
        Ok(self)
    }

    pub fn feed(mut self, feed: FeedSpec) -> Self {
        self.feeds.push(feed);
        self
    }

    pub fn bind(mut self, source: SourceId, binding: RouterBinding) -> Self {
        self.bindings.insert(source, binding);
        self
    }

    /// Take ownership of a stage worker so teardown joins it.
    pub fn worker(mut self, worker: StageWorker) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.feeds.is_empty() {
            bail!("pipeline has no feeds");
        }
        for feed in &self.feeds {
            for source in feed.sources() {
                if !self.sources.contains_key(&source) {
                    bail!("feed references unregistered source {}", source);
                }
            }
        }
        let router = Router::new(self.store.clone(), self.bindings);
        Ok(Pipeline {
            store: self.store,
            terminate: self.terminate,
            router: Arc::new(router),
            pop_timeout: self.pop_timeout,
            sources: self.sources,
            feeds: self.feeds,
            workers: self.workers,
            consumers: Vec::new(),
        })
    }
}

/// A running (or runnable) pipeline instance.
pub struct Pipeline {
    store: Arc<FrameStore>,
    terminate: TerminateFlag,
    router: Arc<Router>,
    pop_timeout: Duration,
    sources: HashMap<SourceId, SourceEntry>,
    feeds: Vec<FeedSpec>,
    workers: Vec<StageWorker>,
    consumers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn builder(
        store: Arc<FrameStore>,
        terminate: TerminateFlag,
        max_sources: usize,
    ) -> PipelineBuilder {
        PipelineBuilder::new(store, terminate, max_sources)
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn sources(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.sources.keys().copied()
    }

    pub fn queue(&self, source: SourceId) -> Option<Arc<SourceQueue<FrameRecord>>> {
        self.sources.get(&source).map(|entry| entry.queue.clone())
    }

    pub fn queue_depth(&self, source: SourceId) -> usize {
        self.sources
            .get(&source)
            .map(|entry| entry.queue.len())
            .unwrap_or(0)
    }

    /// Capture-facing entry point: push a freshly captured frame onto its
    /// source's queue. Eviction under overflow is logged and evicted frames
    /// already tracked in the store are released through it; untracked ones
    /// are simply dropped.
    pub fn offer(&self, source: SourceId, frame: FrameRecord) -> bool {
        let Some(entry) = self.sources.get(&source) else {
            log::warn!("offer to unregistered source {}", source);
            return false;
        };
        let result = entry.queue.push(frame);
        if !result.evicted.is_empty() {
            log::warn!(
                "source {} queue full, evicting {} oldest frame(s)",
                source,
                result.evicted.len()
            );
        }
        for old in result.evicted {
            if old.is_tracked() {
                self.store.try_delete(old.source_id, old.sequence());
            }
        }
        result.accepted
    }

    /// Spawn one consumer thread per feed. Call once.
    pub fn start(&mut self) -> Result<()> {
        if !self.consumers.is_empty() {
            bail!("pipeline already started");
        }
        log::info!(
            "pipeline starting: {} source(s), {} feed(s)",
            self.sources.len(),
            self.feeds.len()
        );
        let feeds = self.feeds.clone();
        for feed in feeds {
            let handle = match feed {
                FeedSpec::Mono(id) => self.spawn_mono(id)?,
                FeedSpec::DualMono(a, b) => self.spawn_dual(a, b)?,
                FeedSpec::Stereo(a, b) => self.spawn_stereo(a, b)?,
            };
            self.consumers.push(handle);
        }
        Ok(())
    }

    fn consumer_ctx(&self, id: SourceId) -> Result<ConsumerCtx> {
        let queue = self
            .queue(id)
            .ok_or_else(|| anyhow!("source {} not registered", id))?;
        Ok(ConsumerCtx {
            queue,
            store: self.store.clone(),
            router: self.router.clone(),
            terminate: self.terminate.clone(),
            pop_timeout: self.pop_timeout,
        })
    }

    fn spawn_mono(&self, id: SourceId) -> Result<JoinHandle<()>> {
        let ctx = self.consumer_ctx(id)?;
        spawn_consumer(format!("feed-{}", id), move || {
            log::info!("mono consumer for source {} running", id);
            while !ctx.terminate.is_set() {
                let Some(frame) = ctx.queue.pop_blocking(ctx.pop_timeout) else {
                    continue;
                };
                let seq = ctx.store.insert(id, frame);
                ctx.router
                    .dispatch(&[ReadyUnit::mono(FrameKey::new(id, seq))]);
            }
        })
    }

    fn spawn_dual(&self, a: SourceId, b: SourceId) -> Result<JoinHandle<()>> {
        let ctx_a = self.consumer_ctx(a)?;
        let queue_b = self
            .queue(b)
            .ok_or_else(|| anyhow!("source {} not registered", b))?;
        spawn_consumer(format!("feed-{}-{}", a, b), move || {
            log::info!("dual-mono consumer for sources {} and {} running", a, b);
            while !ctx_a.terminate.is_set() {
                let mut batch = Vec::with_capacity(2);
                if let Some(frame) = ctx_a.queue.pop_blocking(ctx_a.pop_timeout) {
                    let seq = ctx_a.store.insert(a, frame);
                    batch.push(ReadyUnit::mono(FrameKey::new(a, seq)));
                }
                if let Some(frame) = queue_b.try_pop() {
                    let seq = ctx_a.store.insert(b, frame);
                    batch.push(ReadyUnit::mono(FrameKey::new(b, seq)));
                }
                if !batch.is_empty() {
                    ctx_a.router.dispatch(&batch);
                }
            }
        })
    }

    fn spawn_stereo(&self, left: SourceId, right: SourceId) -> Result<JoinHandle<()>> {
        let ctx = self.consumer_ctx(left)?;
        let queue_right = self
            .queue(right)
            .ok_or_else(|| anyhow!("source {} not registered", right))?;
        spawn_consumer(format!("feed-{}x{}", left, right), move || {
            log::info!(
                "stereo consumer for pair ({}, {}) running",
                left,
                right
            );
            while !ctx.terminate.is_set() {
                let Some(frame_left) = ctx.queue.pop_blocking(ctx.pop_timeout) else {
                    continue;
                };
                // Join step: wait briefly for the partner; a missing partner
                // degrades the sample to mono rather than discarding it.
                let unit = match queue_right.pop_blocking(ctx.pop_timeout) {
                    Some(frame_right) => {
                        let seq = ctx.store.insert_stereo(left, frame_left, right, frame_right);
                        let key_l = FrameKey::new(left, seq);
                        let key_r = FrameKey::new(right, seq);
                        ctx.store.stereo().link(key_l, key_r);
                        ReadyUnit::pair(key_l, key_r)
                    }
                    None => {
                        let seq = ctx.store.insert(left, frame_left);
                        ReadyUnit::mono(FrameKey::new(left, seq))
                    }
                };
                ctx.router.dispatch(&[unit]);
            }
        })
    }

    /// Signal termination, join every thread and reclaim all per-source
    /// state. Safe to call once after `start` (or without it).
    pub fn shutdown(mut self) {
        self.terminate.set();
        log::info!("pipeline shutting down");
        for consumer in self.consumers.drain(..) {
            let _ = consumer.join();
        }
        for worker in self.workers.drain(..) {
            worker.join();
        }
        for (id, entry) in &self.sources {
            entry.queue.clear();
            self.store.clear_all(*id);
        }
        log::info!("pipeline stopped, {} frames left in store", self.store.len());
    }
}

struct ConsumerCtx {
    queue: Arc<SourceQueue<FrameRecord>>,
    store: Arc<FrameStore>,
    router: Arc<Router>,
    terminate: TerminateFlag,
    pop_timeout: Duration,
}

fn spawn_consumer<F>(name: String, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|e| anyhow!("failed to spawn {}: {}", name, e))
}
