//! framed - frame pipeline daemon
//!
//! This daemon:
//! 1. Drives one synthetic capture thread per configured source
//! 2. Buffers captured frames in bounded per-source queues (oldest evicted)
//! 3. Routes ready frames to detect/track/render stages by priority
//! 4. Enforces single-render through the process-wide render gate
//! 5. Reclaims frames as soon as their last stage latch clears
//!
//! Real deployments replace the synthetic capture threads with camera
//! glue that calls [`Pipeline::offer`] from their capture callbacks.

use anyhow::Result;
use clap::Parser;
use rand::RngCore;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use frame_kernel::{
    simulated_workload, FeedSpec, FramePayload, FrameRecord, InlineRenderer, Pipeline,
    PipelineConfig, RenderGate, RenderMode, RouterBinding, StageKind, StageWorker, TerminateFlag,
};

const DETECT_COST: Duration = Duration::from_millis(12);
const TRACK_COST: Duration = Duration::from_millis(4);
const RENDER_COST: Duration = Duration::from_millis(8);
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Frame pipeline daemon with synthetic sources")]
struct Args {
    /// Run for this many seconds, then shut down. Runs until SIGINT if unset.
    #[arg(long, env = "FRAME_DURATION_SECS")]
    duration_secs: Option<u64>,

    /// Override the configured number of synthetic capture sources.
    #[arg(long, env = "FRAME_SOURCES")]
    sources: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = PipelineConfig::load()?;
    if let Some(sources) = args.sources {
        cfg.capture.sources = sources.clamp(1, cfg.max_sources);
    }
    log::info!(
        "framed v{}: {} source(s) @ {} fps, queue capacity {}, render mode {:?}",
        env!("CARGO_PKG_VERSION"),
        cfg.capture.sources,
        cfg.capture.target_fps,
        cfg.queue_capacity,
        cfg.render_mode
    );

    let terminate = TerminateFlag::new();
    {
        let terminate = terminate.clone();
        ctrlc::set_handler(move || {
            log::info!("interrupt received, shutting down");
            terminate.set();
        })?;
    }

    let store = Arc::new(frame_kernel::FrameStore::new());
    let detect = StageWorker::spawn(
        "detect",
        StageKind::Detect,
        cfg.stage_depth,
        store.clone(),
        terminate.clone(),
        None,
        simulated_workload(DETECT_COST),
    )?;
    let track = StageWorker::spawn(
        "track",
        StageKind::Track,
        cfg.stage_depth,
        store.clone(),
        terminate.clone(),
        None,
        simulated_workload(TRACK_COST),
    )?;

    let mut render_worker = None;
    let mut inline_renderer = None;
    let renderer: Arc<dyn frame_kernel::Stage> = match cfg.render_mode {
        RenderMode::Threaded => {
            let gate = Arc::new(RenderGate::new());
            let worker = StageWorker::spawn(
                "render",
                StageKind::Render,
                cfg.stage_depth,
                store.clone(),
                terminate.clone(),
                Some(gate),
                simulated_workload(RENDER_COST),
            )?;
            let input = worker.input();
            render_worker = Some(worker);
            input
        }
        RenderMode::Inline => {
            let inline = Arc::new(InlineRenderer::new(cfg.stage_depth, store.clone()));
            inline_renderer = Some(inline.clone());
            inline
        }
    };

    let mut builder = Pipeline::builder(store.clone(), terminate.clone(), cfg.max_sources)
        .pop_timeout(cfg.pop_timeout);
    for id in 0..cfg.capture.sources as u64 {
        builder = builder.source(id, cfg.queue_capacity)?;
        builder = builder.feed(FeedSpec::Mono(id));
        builder = builder.bind(
            id,
            RouterBinding {
                detector: Some(detect.input()),
                tracker: Some(track.input()),
                renderer: Some(renderer.clone()),
                drop_unclaimed: true,
            },
        );
    }
    builder = builder.worker(detect).worker(track);
    if let Some(worker) = render_worker {
        builder = builder.worker(worker);
    }

    let mut pipeline = builder.build()?;
    pipeline.start()?;
    let pipeline = Arc::new(pipeline);

    let capture_threads = spawn_capture_sources(&cfg, pipeline.clone(), terminate.clone())?;
    log::info!("framed running");

    let started = Instant::now();
    let deadline = args.duration_secs.map(Duration::from_secs);
    let mut last_health = Instant::now();
    while !terminate.is_set() {
        if let Some(limit) = deadline {
            if started.elapsed() >= limit {
                log::info!("run duration reached, shutting down");
                terminate.set();
                break;
            }
        }
        let mut rendered = false;
        if let Some(inline) = &inline_renderer {
            rendered = inline.poll_one(|frame| {
                std::thread::sleep(RENDER_COST);
                log::debug!(
                    "rendered frame {}/{} ({}x{})",
                    frame.source_id,
                    frame.sequence(),
                    frame.width,
                    frame.height
                );
            });
        }
        if last_health.elapsed() >= HEALTH_INTERVAL {
            log_health(&pipeline);
            last_health = Instant::now();
        }
        if !rendered {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    for handle in capture_threads {
        let _ = handle.join();
    }
    log_health(&pipeline);
    match Arc::try_unwrap(pipeline) {
        Ok(pipeline) => pipeline.shutdown(),
        Err(_) => log::warn!("pipeline still referenced at shutdown, skipping drain"),
    }
    log::info!("framed stopped");
    Ok(())
}

/// One thread per source, pushing noise frames at the target rate.
fn spawn_capture_sources(
    cfg: &PipelineConfig,
    pipeline: Arc<Pipeline>,
    terminate: TerminateFlag,
) -> Result<Vec<JoinHandle<()>>> {
    let interval = Duration::from_secs(1) / cfg.capture.target_fps;
    let width = cfg.capture.width;
    let height = cfg.capture.height;
    let mut threads = Vec::with_capacity(cfg.capture.sources);
    for id in 0..cfg.capture.sources as u64 {
        let pipeline = pipeline.clone();
        let terminate = terminate.clone();
        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", id))
            .spawn(move || {
                let mut rng = rand::thread_rng();
                let mut captured = 0u64;
                while !terminate.is_set() {
                    let mut data = vec![0u8; (width * height) as usize];
                    rng.fill_bytes(&mut data);
                    let frame = FrameRecord::new(id, width, height, FramePayload::new(data));
                    if pipeline.offer(id, frame) {
                        captured += 1;
                    }
                    std::thread::sleep(interval);
                }
                log::info!("capture source {} stopping after {} frames", id, captured);
            })
            .map_err(|e| anyhow::anyhow!("failed to spawn capture-{}: {}", id, e))?;
        threads.push(handle);
    }
    Ok(threads)
}

fn log_health(pipeline: &Pipeline) {
    let store = pipeline.store();
    let counters = store.counters();
    log::info!(
        "health: {} frame(s) in store (~{} KB), gated deletes={}, stale lookups={}",
        store.len(),
        store.payload_bytes() / 1024,
        counters.gated_deletes,
        counters.stale_lookups
    );
    for source in pipeline.sources() {
        if let Some(stats) = pipeline.router().stats(source) {
            log::info!(
                "health: source {} detect={} track={} render={} dropped={} queued={}",
                source,
                stats.detect,
                stats.track,
                stats.render,
                stats.dropped,
                pipeline.queue_depth(source)
            );
        }
    }
}
