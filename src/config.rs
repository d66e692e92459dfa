use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_MAX_SOURCES: usize = 4;
const DEFAULT_QUEUE_CAPACITY: usize = 2;
const DEFAULT_STAGE_DEPTH: usize = 1;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;
const DEFAULT_POP_TIMEOUT_MS: u64 = 100;

/// How the render stage is driven.
///
/// `Threaded` runs a dedicated render worker behind the process-wide render
/// gate. `Inline` services render work from the driving loop itself; the gate
/// is unnecessary there because one thread renders by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Threaded,
    Inline,
}

impl RenderMode {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "threaded" => Ok(Self::Threaded),
            "inline" => Ok(Self::Inline),
            other => Err(anyhow!(
                "render mode must be \"threaded\" or \"inline\", got {:?}",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    max_sources: Option<usize>,
    queue_capacity: Option<usize>,
    stage_depth: Option<usize>,
    render_mode: Option<String>,
    pop_timeout_ms: Option<u64>,
    capture: Option<CaptureConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    sources: Option<usize>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on registered sources; registration past this fails.
    pub max_sources: usize,
    /// Capacity of each per-source capture queue.
    pub queue_capacity: usize,
    /// Admission depth of each stage worker's inbox (clamped to 1..=2).
    pub stage_depth: usize,
    pub render_mode: RenderMode,
    /// How long a consumer loop blocks on an empty queue before re-checking
    /// the terminate flag.
    pub pop_timeout: Duration,
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Number of synthetic capture sources the daemon drives.
    pub sources: usize,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl PipelineConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FRAME_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let max_sources = file.max_sources.unwrap_or(DEFAULT_MAX_SOURCES);
        let queue_capacity = file.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
        let stage_depth = file.stage_depth.unwrap_or(DEFAULT_STAGE_DEPTH);
        let render_mode = match file.render_mode.as_deref() {
            Some(raw) => RenderMode::parse(raw)?,
            None => RenderMode::Threaded,
        };
        let pop_timeout =
            Duration::from_millis(file.pop_timeout_ms.unwrap_or(DEFAULT_POP_TIMEOUT_MS));
        let capture = CaptureSettings {
            sources: file
                .capture
                .as_ref()
                .and_then(|capture| capture.sources)
                .unwrap_or(max_sources.min(2)),
            target_fps: file
                .capture
                .as_ref()
                .and_then(|capture| capture.target_fps)
                .unwrap_or(DEFAULT_TARGET_FPS),
            width: file
                .capture
                .as_ref()
                .and_then(|capture| capture.width)
                .unwrap_or(DEFAULT_FRAME_WIDTH),
            height: file
                .capture
                .and_then(|capture| capture.height)
                .unwrap_or(DEFAULT_FRAME_HEIGHT),
        };
        Ok(Self {
            max_sources,
            queue_capacity,
            stage_depth,
            render_mode,
            pop_timeout,
            capture,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var("FRAME_MAX_SOURCES") {
            self.max_sources = raw
                .parse()
                .map_err(|_| anyhow!("FRAME_MAX_SOURCES must be an integer"))?;
        }
        if let Ok(raw) = std::env::var("FRAME_QUEUE_CAPACITY") {
            self.queue_capacity = raw
                .parse()
                .map_err(|_| anyhow!("FRAME_QUEUE_CAPACITY must be an integer"))?;
        }
        if let Ok(raw) = std::env::var("FRAME_STAGE_DEPTH") {
            self.stage_depth = raw
                .parse()
                .map_err(|_| anyhow!("FRAME_STAGE_DEPTH must be an integer"))?;
        }
        if let Ok(raw) = std::env::var("FRAME_RENDER_MODE") {
            if !raw.trim().is_empty() {
                self.render_mode = RenderMode::parse(&raw)?;
            }
        }
        if let Ok(raw) = std::env::var("FRAME_TARGET_FPS") {
            self.capture.target_fps = raw
                .parse()
                .map_err(|_| anyhow!("FRAME_TARGET_FPS must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.max_sources == 0 {
            return Err(anyhow!("max_sources must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be greater than zero"));
        }
        if !(1..=2).contains(&self.stage_depth) {
            return Err(anyhow!("stage_depth must be 1 or 2"));
        }
        if self.pop_timeout.is_zero() {
            return Err(anyhow!("pop_timeout_ms must be greater than zero"));
        }
        if self.capture.sources == 0 || self.capture.sources > self.max_sources {
            return Err(anyhow!(
                "capture.sources must be in 1..={}",
                self.max_sources
            ));
        }
        if self.capture.target_fps == 0 || self.capture.target_fps > 240 {
            return Err(anyhow!("capture.target_fps must be in 1..=240"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture dimensions must be non-zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
