//! Per-clip frame access: random access through the frame cache, or a
//! sequential [`VideoStream`] during forward playback.
//!
//! Streaming is used when the clip is longer than one decode buffer, the user
//! is not scrubbing, no ancestor warps time with a curve and the effective
//! playback direction is forward. Otherwise frames come from the
//! [`FrameCache`] and misses fall back to the nearest recently seen frame,
//! then to the last frame drawn. Final (export) rendering never falls back:
//! a structurally missing frame is a [`CutstripError::MissingFrame`].
//!
//! A scrub that jumps by a buffer or more bumps the cache epoch, so decodes
//! still queued for the old playhead position are dropped.
//!
//! Replaced streams are stopped but not joined here; owners collect them with
//! [`StreamManager::take_retired`] and join them outside their own locks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::EngineConfig;
use crate::core::decoder::VideoDecoder;
use crate::core::frame_cache::{FrameCache, FrameCacheKey, FrameLookup};
use crate::core::readiness::FrameReadiness;
use crate::core::stream::{StreamOptions, VideoStream};
use crate::entities::{DecodedFrame, LoopMode, MediaSource, NodeId, Scene, SceneNode};
use crate::error::{CutstripError, CutstripResult};

/// Recently requested frame indices remembered for interactive fallback
const LAST_FRAMES: usize = 5;

/// Minimum spacing of "missing frame" warnings per clip
const WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Editor state relevant to frame selection, passed explicitly.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    pub final_render: bool,
    /// Interactive scrubbing (e.g. dragging the playhead)
    pub scrubbing: bool,
    /// Signed playback speed of the editor
    pub editor_dilation: f64,
    /// Root-most ancestor first, the clip's node last
    pub chain: Vec<Arc<SceneNode>>,
}

/// -1, 0 or 1. Zero dilation counts as standing still.
fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl StreamContext {
    pub fn interactive(editor_dilation: f64) -> Self {
        Self { editor_dilation, ..Self::default() }
    }

    pub fn final_render() -> Self {
        Self { final_render: true, editor_dilation: 1.0, ..Self::default() }
    }

    /// Attach the ancestor chain of `node` from `scene`.
    pub fn with_chain_of(mut self, scene: &Scene, node: NodeId) -> Self {
        self.chain = scene.chain(node);
        self
    }

    pub fn has_simple_time(&self) -> bool {
        self.chain.iter().all(|n| !n.has_animated_time())
    }

    /// Product of the dilation signs along the chain.
    pub fn absolute_dilation_sign(&self) -> f64 {
        self.chain.iter().map(|n| sign(n.time_dilation)).product()
    }

    pub fn is_playing_forward(&self) -> bool {
        let dilation = self.absolute_dilation_sign();
        if self.final_render {
            dilation > 0.0
        } else {
            self.editor_dilation * dilation >= 0.0
        }
    }
}

/// Stream and cache access for one media clip.
pub struct StreamManager {
    source: MediaSource,
    cache: Arc<FrameCache>,
    decoder: Arc<dyn VideoDecoder>,
    frames_per_buffer: i64,
    lookahead: i64,
    stream_options: StreamOptions,
    stream: Option<VideoStream>,
    /// Stopped streams whose threads were not joined yet
    retired: Vec<VideoStream>,
    was_final: Option<bool>,
    last_scrub_frame: Option<i64>,
    last_frame: Option<DecodedFrame>,
    last_frames: [i64; LAST_FRAMES],
    last_warning: Option<Instant>,
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("source", &self.source.path)
            .field("stream", &self.stream)
            .field("retired", &self.retired.len())
            .field("was_final", &self.was_final)
            .finish_non_exhaustive()
    }
}

impl StreamManager {
    pub fn new(
        source: MediaSource,
        cache: Arc<FrameCache>,
        decoder: Arc<dyn VideoDecoder>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            source,
            cache,
            decoder,
            frames_per_buffer: config.frames_per_buffer.max(1),
            lookahead: config.stream_lookahead,
            stream_options: StreamOptions {
                capacity: ((config.stream_lookahead as usize + 1) * 4).max(16),
                idle_timeout: Duration::from_millis(config.stream_idle_timeout_ms),
            },
            stream: None,
            retired: Vec::new(),
            was_final: None,
            last_scrub_frame: None,
            last_frame: None,
            last_frames: [-1; LAST_FRAMES],
            last_warning: None,
        }
    }

    pub fn source(&self) -> &MediaSource {
        &self.source
    }

    /// Replace the source, e.g. after the file changed. Drops the stream.
    pub fn set_source(&mut self, source: MediaSource) {
        if source.source_id != self.source.source_id {
            self.retire_stream();
            self.last_frame = None;
            self.last_scrub_frame = None;
            self.last_frames = [-1; LAST_FRAMES];
        }
        self.source = source;
    }

    /// Short clips live entirely in one buffer and are cheaper to cache.
    pub fn is_cacheable(&self) -> bool {
        self.source.meta.frame_count <= self.frames_per_buffer
    }

    pub fn can_stream(&self, ctx: &StreamContext) -> bool {
        !self.is_cacheable() && !ctx.scrubbing && ctx.has_simple_time() && ctx.is_playing_forward()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| s.is_alive())
    }

    fn latch_mode(&mut self, ctx: &StreamContext) -> CutstripResult<()> {
        if let Some(was_final) = self.was_final {
            if was_final != ctx.final_render {
                return Err(CutstripError::ModeChanged { was_final });
            }
        }
        self.was_final = Some(ctx.final_render);
        Ok(())
    }

    /// Frame from the sequential stream, creating or replacing the stream when
    /// source, zoom or rate changed.
    pub fn stream_frame(
        &mut self,
        ctx: &StreamContext,
        zoom: i32,
        frame_index: i64,
        fps: f64,
    ) -> CutstripResult<Option<DecodedFrame>> {
        self.latch_mode(ctx)?;
        let reuse = self
            .stream
            .as_ref()
            .is_some_and(|s| s.is_alive() && s.matches(self.source.source_id, zoom, fps));
        if !reuse {
            if let Some(old) = self.stream.as_ref() {
                debug!("Replacing stream for {} (z{} -> z{})", self.source.path, old.zoom(), zoom);
            }
            self.retire_stream();
            self.stream = Some(VideoStream::start(
                Arc::clone(&self.decoder),
                &self.source,
                zoom,
                fps,
                frame_index,
                self.stream_options,
            ));
        }

        let Some(stream) = self.stream.as_ref() else {
            return Ok(None);
        };
        let frame = stream.get_frame(frame_index, self.lookahead);
        Ok(match frame {
            None => None,
            Some(f) if ctx.final_render && f.frame_index() != frame_index => None,
            Some(f) if !f.is_created() => None,
            Some(f) => Some(f),
        })
    }

    fn retire_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            self.retired.push(stream);
        }
    }

    /// Streams stopped since the last call. Dropping them joins their threads.
    pub fn take_retired(&mut self) -> Vec<VideoStream> {
        std::mem::take(&mut self.retired)
    }

    /// Bump the cache epoch when a scrub jumps by a buffer or more.
    fn note_scrub(&mut self, frame_index: i64) {
        let jumped = self
            .last_scrub_frame
            .is_some_and(|last| (frame_index - last).abs() >= self.frames_per_buffer);
        if jumped {
            let epoch = self.cache.cache_manager().increment_epoch();
            debug!("Scrub jump on {} to frame {} (epoch {})", self.source.path, frame_index, epoch);
        }
        self.last_scrub_frame = Some(frame_index);
    }

    fn key(&self, zoom: i32, frame_index: i64, fps: f64) -> FrameCacheKey {
        FrameCacheKey::for_frame(self.source.source_id, zoom, frame_index, self.frames_per_buffer, fps)
    }

    fn remember(&mut self, frame_index: i64) {
        if self.last_frames.contains(&frame_index) {
            return;
        }
        self.last_frames.rotate_left(1);
        self.last_frames[LAST_FRAMES - 1] = frame_index;
    }

    fn note_missing(&mut self, frame_index: i64) {
        let now = Instant::now();
        if self.last_warning.is_none_or(|t| now.duration_since(t) >= WARN_INTERVAL) {
            warn!("Frame {} of {} not available yet", frame_index, self.source.path);
            self.last_warning = Some(now);
        }
    }

    /// One frame through stream or cache, with nothing substituted.
    fn fetch(
        &mut self,
        ctx: &StreamContext,
        streaming: bool,
        zoom: i32,
        frame_index: i64,
        fps: f64,
        count: i64,
    ) -> CutstripResult<FrameLookup> {
        if !(0..count).contains(&frame_index) {
            return Ok(FrameLookup::Missing);
        }
        if streaming {
            return Ok(match self.stream_frame(ctx, zoom, frame_index, fps)? {
                Some(f) => FrameLookup::Ready(f),
                None => FrameLookup::Pending,
            });
        }
        let key = self.key(zoom, frame_index, fps);
        Ok(match self.cache.get_frame(&self.source, key, frame_index) {
            FrameLookup::Ready(f) if f.is_created() => FrameLookup::Ready(f),
            FrameLookup::Ready(_) => FrameLookup::Pending,
            other => other,
        })
    }

    /// Closest frame among the exact one and the recently requested ones.
    fn closest_frame(&mut self, zoom: i32, frame_index: i64, fps: f64) -> FrameLookup {
        let key = self.key(zoom, frame_index, fps);
        let exact = self.cache.get_frame(&self.source, key, frame_index);
        if let FrameLookup::Ready(f) = &exact {
            if f.is_created() {
                self.remember(frame_index);
                return exact;
            }
        }

        let mut best: Option<DecodedFrame> = None;
        for &idx in self.last_frames.iter().filter(|&&i| i >= 0) {
            let closer = best
                .as_ref()
                .is_none_or(|b| (idx - frame_index).abs() < (b.frame_index() - frame_index).abs());
            if !closer {
                continue;
            }
            if let FrameLookup::Ready(f) = self.cache.lookup(&self.key(zoom, idx, fps), idx) {
                if f.is_created() {
                    best = Some(f);
                }
            }
        }
        match best {
            Some(f) => FrameLookup::Ready(f),
            None => exact,
        }
    }

    /// First non-blank frame in `[frame_index, frame_index + lookahead]`.
    fn skip_blank(
        &mut self,
        ctx: &StreamContext,
        streaming: bool,
        zoom: i32,
        frame_index: i64,
        fps: f64,
        count: i64,
    ) -> CutstripResult<FrameLookup> {
        let first = self.fetch(ctx, streaming, zoom, frame_index, fps, count)?;
        match &first {
            FrameLookup::Ready(f) if f.is_blank() => {}
            _ => return Ok(first),
        }
        for delta in 1..=self.lookahead {
            match self.fetch(ctx, streaming, zoom, frame_index + delta, fps, count)? {
                FrameLookup::Ready(f) if !f.is_blank() => return Ok(FrameLookup::Ready(f)),
                FrameLookup::Ready(_) => continue,
                _ => break,
            }
        }
        Ok(first)
    }

    fn missing_frame(&self, frame_index: i64) -> CutstripError {
        CutstripError::MissingFrame {
            source_id: self.source.source_id,
            path: self.source.path.clone(),
            frame_index,
        }
    }

    /// Frame to draw for `frame_index`, with the interactive fallbacks.
    ///
    /// Final rendering returns `Pending` while the frame is still decoding and
    /// fails with `MissingFrame` when it can never arrive.
    pub fn resolve_frame(
        &mut self,
        ctx: &StreamContext,
        zoom: i32,
        frame_index: i64,
        fps: f64,
    ) -> CutstripResult<FrameLookup> {
        let zoom = zoom.max(1);
        if ctx.scrubbing && !ctx.final_render {
            self.note_scrub(frame_index);
        }
        let count = self.source.frame_count_at(fps);
        if frame_index < 0 || frame_index >= count {
            if ctx.final_render {
                return Err(self.missing_frame(frame_index));
            }
            self.note_missing(frame_index);
            return Ok(self.fallback(FrameLookup::Missing));
        }

        let streaming = self.can_stream(ctx);
        let primary = if self.source.blank_frame_threshold > 0.0 {
            self.skip_blank(ctx, streaming, zoom, frame_index, fps, count)?
        } else if streaming || ctx.final_render {
            let f = self.fetch(ctx, streaming, zoom, frame_index, fps, count)?;
            self.remember(frame_index);
            f
        } else {
            self.closest_frame(zoom, frame_index, fps)
        };

        if let FrameLookup::Ready(f) = &primary {
            if f.is_created() {
                self.last_frame = Some(f.clone());
                return Ok(primary);
            }
        }

        if ctx.final_render {
            return match primary {
                FrameLookup::Missing => {
                    Err(self.missing_frame(frame_index))
                }
                _ => Ok(FrameLookup::Pending),
            };
        }

        self.note_missing(frame_index);
        let cached = self.cache.lookup(&self.key(zoom, frame_index, fps), frame_index);
        if let FrameLookup::Ready(f) = &cached {
            if f.is_created() {
                self.last_frame = Some(f.clone());
                return Ok(cached);
            }
        }
        Ok(self.fallback(primary))
    }

    /// Last drawn frame if still alive, else `otherwise`.
    fn fallback(&self, otherwise: FrameLookup) -> FrameLookup {
        match &self.last_frame {
            Some(f) if f.is_created() => FrameLookup::Ready(f.clone()),
            _ => otherwise,
        }
    }

    /// Queue decode buffers covering local times `[min_t, max_t]`.
    ///
    /// Skipped while streaming; the stream decodes on its own.
    pub fn claim(&self, ctx: &StreamContext, min_t: f64, max_t: f64, zoom: i32) {
        if self.can_stream(ctx) {
            return;
        }
        let source = &self.source;
        if !(source.meta.fps > 0.0) || !source.meta.has_video {
            return;
        }
        let plays_once = source.loop_mode == LoopMode::PlayOnce && !source.stay_visible_at_end;
        if max_t < 0.0 || (plays_once && min_t >= source.duration()) {
            return;
        }
        let fps = source.playback_fps(ctx.final_render);
        let buff0 = (min_t * fps) as i64;
        let buff1 = (max_t * fps) as i64;
        let steps = (2 + (buff1 - buff0) / self.frames_per_buffer).clamp(2, 20);
        let count = source.frame_count_at(fps);

        let mut last_buffer = -1;
        for step in 0..steps {
            let t = min_t + (max_t - min_t) * step as f64 / (steps - 1) as f64;
            let local = source.loop_mode.apply(t, source.duration());
            let frame_index = (local * fps) as i64;
            if frame_index < 0 || frame_index >= count {
                continue;
            }
            let buffer = frame_index / self.frames_per_buffer;
            if buffer != last_buffer {
                last_buffer = buffer;
                self.cache.request_buffer(source, self.key(zoom.max(1), frame_index, fps));
            }
        }
    }

    /// Diagnostic status of a frame held by the stream.
    pub fn stream_status(&self, frame_index: i64) -> FrameReadiness {
        match self.stream.as_ref().filter(|s| s.is_alive()).and_then(|s| s.peek(frame_index)) {
            Some(f) if f.is_on_gpu() => FrameReadiness::StreamReady,
            Some(f) if f.is_created() => FrameReadiness::StreamAwaitingUpload,
            _ => FrameReadiness::Missing,
        }
    }

    /// Stop the stream and join every stopped thread. The mode latch and
    /// fallback frame stay.
    pub fn destroy(&mut self) {
        self.retire_stream();
        for mut stream in self.retired.drain(..) {
            stream.destroy();
            debug!("Stream destroyed for {}", self.source.path);
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache_man::CacheManager;
    use crate::core::decoder::SyntheticDecoder;
    use crate::core::event_bus::EventBus;
    use crate::core::workers::Workers;
    use crate::entities::{AnimatedValue, SourceMeta};

    fn manager_for(frames: i64, decoder: Arc<SyntheticDecoder>) -> StreamManager {
        let config = EngineConfig::default();
        let cache_manager = Arc::new(CacheManager::with_limit(usize::MAX / 2));
        let workers = Arc::new(Workers::inline(cache_manager.epoch_ref()));
        let cache = FrameCache::new(&config, cache_manager, workers, decoder.clone(), EventBus::new());
        let source = MediaSource::new("clip.mp4", SourceMeta::video(320, 240, 30.0, frames));
        StreamManager::new(source, cache, decoder, &config)
    }

    fn chain(dilations: &[f64]) -> Vec<Arc<SceneNode>> {
        dilations
            .iter()
            .map(|&d| Arc::new(SceneNode::new("n").with_time(0.0, d)))
            .collect()
    }

    #[test]
    fn test_direction_accounts_for_every_ancestor() {
        let mut ctx = StreamContext::interactive(1.0);
        ctx.chain = chain(&[1.0, -2.0, -0.5]);
        assert!(ctx.is_playing_forward());
        ctx.chain = chain(&[1.0, -2.0]);
        assert!(!ctx.is_playing_forward());
        ctx.editor_dilation = -1.0;
        assert!(ctx.is_playing_forward());

        let mut fin = StreamContext::final_render();
        fin.chain = chain(&[1.0, 0.0]);
        assert!(!fin.is_playing_forward());
    }

    #[test]
    fn test_can_stream_rules() {
        let long = manager_for(1000, Arc::new(SyntheticDecoder::new()));
        let short = manager_for(100, Arc::new(SyntheticDecoder::new()));
        let mut ctx = StreamContext::interactive(1.0);
        ctx.chain = chain(&[1.0]);
        assert!(long.can_stream(&ctx));
        assert!(!short.can_stream(&ctx));

        ctx.scrubbing = true;
        assert!(!long.can_stream(&ctx));
        ctx.scrubbing = false;

        let mut warped = SceneNode::new("warp");
        warped.time_warp = AnimatedValue::from_keys(0.0, [(0.0, 0.0), (1.0, 1.0)]);
        ctx.chain.push(Arc::new(warped));
        assert!(!long.can_stream(&ctx));
    }

    #[test]
    fn test_mode_latch() {
        let mut m = manager_for(1000, Arc::new(SyntheticDecoder::new()));
        m.stream_frame(&StreamContext::interactive(1.0), 1, 0, 30.0).expect("first call");
        let err = m.stream_frame(&StreamContext::final_render(), 1, 0, 30.0).unwrap_err();
        assert!(matches!(err, CutstripError::ModeChanged { was_final: false }));
    }

    #[test]
    fn test_replaced_stream_is_retired_not_joined() {
        let mut m = manager_for(1000, Arc::new(SyntheticDecoder::new()));
        let ctx = StreamContext::interactive(1.0);
        m.stream_frame(&ctx, 1, 0, 30.0).expect("z1");
        m.stream_frame(&ctx, 1, 1, 30.0).expect("same stream");
        assert!(m.take_retired().is_empty());

        m.stream_frame(&ctx, 2, 2, 30.0).expect("z2");
        let retired = m.take_retired();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].zoom(), 1);
        assert!(m.take_retired().is_empty());
        drop(retired);
        m.destroy();
        assert!(!m.has_stream());
    }

    #[test]
    fn test_scrub_jump_bumps_epoch() {
        let mut m = manager_for(1000, Arc::new(SyntheticDecoder::new()));
        let scrub = StreamContext { scrubbing: true, ..StreamContext::interactive(1.0) };
        let epoch = |m: &StreamManager| m.cache.cache_manager().current_epoch();

        assert!(m.resolve_frame(&scrub, 1, 10, 30.0).expect("ok").is_ready());
        m.resolve_frame(&scrub, 1, 40, 30.0).expect("ok");
        assert_eq!(epoch(&m), 0);

        // the request for the new position is queued after the bump
        assert!(m.resolve_frame(&scrub, 1, 600, 30.0).expect("ok").is_ready());
        assert_eq!(epoch(&m), 1);

        m.resolve_frame(&StreamContext::interactive(1.0), 1, 10, 30.0).expect("ok");
        assert_eq!(epoch(&m), 1);
    }

    #[test]
    fn test_interactive_out_of_range_is_placeholder() {
        let mut m = manager_for(100, Arc::new(SyntheticDecoder::new()));
        let ctx = StreamContext::interactive(1.0);
        let r = m.resolve_frame(&ctx, 1, 500, 30.0).expect("never fatal");
        assert!(matches!(r, FrameLookup::Missing));

        // once something was drawn, it is reused
        assert!(m.resolve_frame(&ctx, 1, 10, 30.0).expect("ok").is_ready());
        let r = m.resolve_frame(&ctx, 1, 500, 30.0).expect("never fatal");
        assert_eq!(r.frame().map(|f| f.frame_index()), Some(10));
    }

    #[test]
    fn test_final_out_of_range_is_fatal() {
        let mut m = manager_for(100, Arc::new(SyntheticDecoder::new()));
        let err = m.resolve_frame(&StreamContext::final_render(), 1, 100, 30.0).unwrap_err();
        assert!(err.is_missing_frame());
    }

    #[test]
    fn test_final_broken_buffer_is_fatal() {
        let decoder = Arc::new(SyntheticDecoder::new().with_broken_frames([0]));
        let mut m = manager_for(100, decoder);
        let ctx = StreamContext::final_render();
        // the first call queues the decode, which fails inline
        let _ = m.resolve_frame(&ctx, 1, 5, 30.0);
        let err = m.resolve_frame(&ctx, 1, 5, 30.0).unwrap_err();
        assert!(err.is_missing_frame());
    }

    #[test]
    fn test_blank_frames_are_skipped() {
        let decoder = Arc::new(SyntheticDecoder::new().with_blank_frames([20, 21]));
        let mut m = manager_for(100, decoder);
        m.source.blank_frame_threshold = 0.05;
        let r = m.resolve_frame(&StreamContext::interactive(1.0), 1, 20, 30.0).expect("ok");
        assert_eq!(r.frame().map(|f| f.frame_index()), Some(22));
    }

    #[test]
    fn test_claim_requests_each_buffer_once() {
        let decoder = Arc::new(SyntheticDecoder::new());
        let m = manager_for(1000, decoder.clone());
        let mut ctx = StreamContext::interactive(1.0);
        ctx.scrubbing = true;
        // 0..20 s at 30 fps spans buffers 0..=4
        m.claim(&ctx, 0.0, 20.0, 2);
        assert_eq!(decoder.buffers_decoded(), 5);
        m.claim(&ctx, 0.0, 20.0, 2);
        assert_eq!(decoder.buffers_decoded(), 5);
    }
}
