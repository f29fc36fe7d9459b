//! Engine configuration, config file discovery and logger setup.
//!
//! Config file priority:
//! 1. Explicit path (host application / CLI)
//! 2. `CUTSTRIP_CONFIG` environment variable
//! 3. Platform config directory from dirs-next (`<config>/cutstrip/cutstrip.json`)
//!
//! A missing file yields defaults. Out-of-range values are clamped by
//! [`EngineConfig::sanitize`] instead of rejected.

use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{CutstripError, CutstripResult};

pub const CONFIG_ENV: &str = "CUTSTRIP_CONFIG";
pub const CONFIG_FILE_NAME: &str = "cutstrip.json";

/// Where to look for the config file
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Explicit config file (from CLI or ENV)
    pub config_file: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: explicit path -> `CUTSTRIP_CONFIG` -> None (platform default)
    pub fn from_env_and_cli(cli_file: Option<PathBuf>) -> Self {
        let config_file = cli_file.or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));
        Self { config_file }
    }

    /// Resolved config file path.
    pub fn config_file(&self) -> PathBuf {
        if let Some(path) = &self.config_file {
            return path.clone();
        }
        if let Some(dir) = dirs_next::config_dir() {
            return dir.join("cutstrip").join(CONFIG_FILE_NAME);
        }
        PathBuf::from(CONFIG_FILE_NAME)
    }
}

/// Every tunable of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stacking lines per track view
    pub max_lines: usize,
    /// Visibility threshold on the (multiplied) alpha
    pub min_alpha: f32,
    /// Segment merge tolerance, squared RGBA distance
    pub min_dist_sq: f32,
    /// Alpha factor applied to timeline colors
    pub alpha_multiplier: f32,
    pub frames_per_buffer: i64,
    /// Extra frames requested from a stream (blank-frame elision)
    pub stream_lookahead: i64,
    pub buffer_timeout_ms: u64,
    pub stream_idle_timeout_ms: u64,
    /// Periodic re-solve during playback
    pub playback_resolve_ms: u64,
    /// Re-solve delay after pointer/keyboard interaction
    pub interaction_resolve_ms: u64,
    pub cache_capacity_buffers: usize,
    pub mem_fraction: f64,
    pub reserve_gb: f64,
    pub decode_threads: usize,
    /// Height of the frame-readiness debug strip in pixels (0 = off)
    pub show_frame_status: u32,
    pub relative_video_border: f64,
    pub max_status_scale: u32,
    /// Height of one track row in pixels, used to size thumbnails
    pub row_height: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_lines: 5,
            min_alpha: 0.5 / 255.0,
            min_dist_sq: (3.0f32 / 255.0).powi(2),
            alpha_multiplier: 0.7,
            frames_per_buffer: 128,
            stream_lookahead: 7,
            buffer_timeout_ms: 10_000,
            stream_idle_timeout_ms: 2_000,
            playback_resolve_ms: 1_000,
            interaction_resolve_ms: 50,
            cache_capacity_buffers: 256,
            mem_fraction: 0.5,
            reserve_gb: 2.0,
            decode_threads: default_decode_threads(),
            show_frame_status: 0,
            relative_video_border: 0.1,
            max_status_scale: 32,
            row_height: 45,
        }
    }
}

/// Leave a quarter of the cores to the UI thread.
fn default_decode_threads() -> usize {
    (num_cpus::get() * 3 / 4).max(1)
}

impl EngineConfig {
    /// Load from the resolved config file, falling back to defaults.
    pub fn load(paths: &PathConfig) -> CutstripResult<Self> {
        let path = paths.config_file();
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::from_file(&path).map_err(|e| CutstripError::config(format!("{:#}", e)))
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let cfg: EngineConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(cfg.sanitize())
    }

    pub fn save(&self, path: &Path) -> CutstripResult<()> {
        let write = || -> anyhow::Result<()> {
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
                }
            }
            let text = serde_json::to_string_pretty(self)?;
            std::fs::write(path, text)
                .with_context(|| format!("Failed to write config: {}", path.display()))?;
            Ok(())
        };
        write().map_err(|e| CutstripError::config(format!("{:#}", e)))
    }

    /// Clamp every value into its valid range.
    pub fn sanitize(mut self) -> Self {
        let defaults = Self::default();
        let fix_f32 = |v: f32, lo: f32, hi: f32, d: f32| if v.is_finite() { v.clamp(lo, hi) } else { d };
        let fix_f64 = |v: f64, lo: f64, hi: f64, d: f64| if v.is_finite() { v.clamp(lo, hi) } else { d };

        self.max_lines = self.max_lines.clamp(1, 64);
        self.min_alpha = fix_f32(self.min_alpha, 0.0, 1.0, defaults.min_alpha);
        self.min_dist_sq = fix_f32(self.min_dist_sq, 0.0, 4.0, defaults.min_dist_sq);
        self.alpha_multiplier = fix_f32(self.alpha_multiplier, 0.0, 1.0, defaults.alpha_multiplier);
        self.frames_per_buffer = self.frames_per_buffer.clamp(1, 4096);
        self.stream_lookahead = self.stream_lookahead.clamp(0, 64);
        self.interaction_resolve_ms = self.interaction_resolve_ms.max(1);
        self.playback_resolve_ms = self.playback_resolve_ms.max(self.interaction_resolve_ms);
        self.cache_capacity_buffers = self.cache_capacity_buffers.max(1);
        self.mem_fraction = fix_f64(self.mem_fraction, 0.0, 1.0, defaults.mem_fraction);
        self.reserve_gb = fix_f64(self.reserve_gb, 0.0, 1024.0, defaults.reserve_gb);
        self.decode_threads = self.decode_threads.clamp(1, 256);
        self.relative_video_border = fix_f64(self.relative_video_border, 0.0, 1.0, defaults.relative_video_border);
        self.max_status_scale = self.max_status_scale.clamp(2, 64);
        self.row_height = self.row_height.clamp(12, 1024);
        if self != defaults {
            log_overrides(&defaults, &self);
        }
        self
    }
}

fn log_overrides(defaults: &EngineConfig, cfg: &EngineConfig) {
    if cfg.max_lines != defaults.max_lines {
        info!("Config: max_lines = {}", cfg.max_lines);
    }
    if cfg.frames_per_buffer != defaults.frames_per_buffer {
        warn!(
            "Config: frames_per_buffer = {} (cache keys differ from the default layout)",
            cfg.frames_per_buffer
        );
    }
}

/// Initialise env_logger.
///
/// 0 = warn, 1 = info, 2 = debug, 3+ = trace. Console logging respects
/// `RUST_LOG`; file logging uses the verbosity as-is. Calling twice is a no-op.
pub fn init_logging(verbosity: u8, log_file: Option<&Path>) -> CutstripResult<()> {
    let log_level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let result = if let Some(log_path) = log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;
        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .try_init()
    } else {
        let default_level = match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .try_init()
    };

    if result.is_ok() {
        info!("Logging initialised (level: {:?})", log_level);
    }
    Ok(())
}
