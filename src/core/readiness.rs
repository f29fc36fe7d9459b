//! Frame-readiness diagnostics.
//!
//! Classifies what the caches hold for a frame so the timeline can paint a
//! thin debug strip under video clips. Read-only: probing never requests a
//! decode, never touches LRU order and never changes hit/miss statistics.

use crate::core::frame_cache::{BufferProbe, FrameCache, FrameCacheKey};
use crate::core::stream_manager::StreamManager;
use crate::entities::MediaSource;

/// Ordered best first; a strip shows the best status over all zoom levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FrameReadiness {
    FullScaleReady,
    Ready,
    Blank,
    StreamReady,
    StreamAwaitingUpload,
    WaitForGpuUpload,
    BufferLoading,
    Destroyed,
    NoFrameNeeded,
    Missing,
    InvalidIndex,
    InvalidScale,
}

impl FrameReadiness {
    /// Opaque ARGB color of the status strip.
    pub fn color(self) -> u32 {
        let rgb = match self {
            FrameReadiness::FullScaleReady => 0x24ff2c,
            FrameReadiness::Ready => 0xbbe961,
            FrameReadiness::Blank => 0x000000,
            FrameReadiness::StreamReady => 0x96e978,
            FrameReadiness::StreamAwaitingUpload => 0x75c2e9,
            FrameReadiness::WaitForGpuUpload => 0x61e9e3,
            FrameReadiness::BufferLoading => 0xe9e561,
            FrameReadiness::Destroyed => 0xca55e7,
            FrameReadiness::NoFrameNeeded => 0xa09da1,
            FrameReadiness::Missing => 0x9b634e,
            FrameReadiness::InvalidIndex => 0xe73838,
            FrameReadiness::InvalidScale => 0xe73845,
        };
        0xff00_0000 | rgb
    }
}

/// Caches consulted by the probes.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessSources<'a> {
    pub cache: &'a FrameCache,
    pub streams: Option<&'a StreamManager>,
}

/// `[x0, x1)` painted in one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRun {
    pub x0: i32,
    pub x1: i32,
    pub status: FrameReadiness,
}

/// Status of one frame at one zoom level.
pub fn frame_readiness(
    sources: &ReadinessSources<'_>,
    source: &MediaSource,
    zoom: i32,
    frame_index: i64,
    buffer_len: i64,
    fps: f64,
) -> FrameReadiness {
    if frame_index < 0 {
        return FrameReadiness::InvalidIndex;
    }
    if zoom < 1 {
        return FrameReadiness::InvalidScale;
    }
    let key = FrameCacheKey::for_frame(source.source_id, zoom, frame_index, buffer_len, fps);
    match sources.cache.probe(&key, frame_index) {
        BufferProbe::Absent => match sources.streams {
            Some(streams) => streams.stream_status(frame_index),
            None => FrameReadiness::Missing,
        },
        BufferProbe::Loading => FrameReadiness::BufferLoading,
        BufferProbe::Failed | BufferProbe::NoFrame => FrameReadiness::Missing,
        BufferProbe::Frame(frame) => {
            if frame.is_destroyed() {
                FrameReadiness::Destroyed
            } else if !frame.is_on_gpu() {
                FrameReadiness::WaitForGpuUpload
            } else if source.blank_frame_threshold > 0.0 && frame.is_blank() {
                FrameReadiness::Blank
            } else {
                FrameReadiness::Ready
            }
        }
    }
}

/// Best status over zoom levels `1..max_scale`.
fn best_over_scales(
    sources: &ReadinessSources<'_>,
    source: &MediaSource,
    frame_index: i64,
    buffer_len: i64,
    fps: f64,
    max_scale: i32,
) -> FrameReadiness {
    (1..max_scale.max(2))
        .map(|zoom| {
            match frame_readiness(sources, source, zoom, frame_index, buffer_len, fps) {
                FrameReadiness::Ready if zoom == 1 => FrameReadiness::FullScaleReady,
                status => status,
            }
        })
        .min()
        .unwrap_or(FrameReadiness::Missing)
}

/// Status runs for pixel columns `[x0, x1)`.
///
/// `time_at(x)` maps a column to node-local time. Consecutive columns that
/// land on the same frame reuse the previous answer.
#[allow(clippy::too_many_arguments)]
pub fn readiness_strip(
    sources: &ReadinessSources<'_>,
    source: &MediaSource,
    fps: f64,
    frames_per_buffer: i64,
    max_scale: i32,
    x0: i32,
    x1: i32,
    time_at: impl Fn(i32) -> f64,
) -> Vec<StatusRun> {
    if x1 <= x0 {
        return Vec::new();
    }
    let meta = &source.meta;
    if meta.frame_count <= 1 {
        let status = best_over_scales(sources, source, 0, 1, 1.0, max_scale);
        return vec![StatusRun { x0, x1, status }];
    }

    let count = meta.frame_count.max(1);
    let duration = source.duration();
    let mut runs: Vec<StatusRun> = Vec::new();
    let mut last_frame = -1i64;
    let mut last_status = FrameReadiness::InvalidScale;
    let mut run_start = x0;

    for x in x0..x1 {
        let time = time_at(x);
        let status = if time >= 0.0 && duration > 0.0 {
            let raw = (time * count as f64 / duration) as i64;
            let frame_index = raw % count;
            if frame_index == last_frame {
                last_status
            } else {
                last_frame = frame_index;
                best_over_scales(sources, source, frame_index, frames_per_buffer, fps, max_scale)
            }
        } else {
            FrameReadiness::NoFrameNeeded
        };

        if status != last_status && x > x0 {
            runs.push(StatusRun { x0: run_start, x1: x, status: last_status });
            run_start = x;
        }
        last_status = status;
    }
    runs.push(StatusRun { x0: run_start, x1, status: last_status });
    runs
}
