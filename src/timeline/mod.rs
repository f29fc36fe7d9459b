//! Timeline rows: solving, drawing and frame access for the editor widget.
//!
//! [`Timeline`] is the entry point collaborators use. It owns the frame cache,
//! the decode workers, one [`TrackView`] per row and the serialized solve
//! queue. Every query here is non-blocking; anything not decoded yet comes
//! back as [`FrameLookup::Pending`] and a redraw is requested once it lands.

pub mod gradient;
pub mod mapping;
pub mod paint;
pub mod registry;
pub mod solution;
pub mod solver;
pub mod view;

pub use gradient::GradientSegment;
pub use mapping::TimeMapping;
pub use paint::{DrawCommand, Painter, RecordingPainter};
pub use registry::{thumbnail_width, thumbnail_zoom, StreamRegistry};
pub use solution::{DrawContext, StripeSolution, ThumbnailClaim, ThumbnailSource, AUDIO_BUCKETS};
pub use solver::TrackSolver;
pub use view::{SolveQueue, SolveTrigger, TrackView};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::cache_man::CacheManager;
use crate::core::decoder::{AudioEnvelopeProvider, VideoDecoder};
use crate::core::event_bus::EventBus;
use crate::core::frame_cache::{CacheStats, FrameCache, FrameCacheKey, FrameLookup};
use crate::core::readiness::{readiness_strip, ReadinessSources, StatusRun};
use crate::core::stream_manager::StreamContext;
use crate::core::workers::Workers;
use crate::core::zoom::cacheable_zoom_level;
use crate::entities::{LoopMode, MediaSource, NodeId, Scene};
use crate::error::{CutstripError, CutstripResult};

/// Memory budget of an [`Timeline::inline`] engine.
const INLINE_MEMORY_LIMIT: usize = 1 << 30;

pub struct Timeline {
    config: EngineConfig,
    bus: EventBus,
    cache: Arc<FrameCache>,
    workers: Arc<Workers>,
    audio: Option<Arc<dyn AudioEnvelopeProvider>>,
    solver: TrackSolver,
    queue: SolveQueue,
    views: Mutex<HashMap<i32, Arc<TrackView>>>,
    registry: Arc<StreamRegistry>,
    /// Draw tick counter and the tick of the last preview miss
    tick: AtomicU64,
    missed_tick: AtomicU64,
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("cache", &self.cache)
            .field("workers", &self.workers)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Timeline {
    /// Engine with a decode pool of `config.decode_threads` threads and a
    /// memory budget taken from the host.
    pub fn new(config: EngineConfig, decoder: Arc<dyn VideoDecoder>) -> Self {
        let config = config.sanitize();
        let manager = Arc::new(CacheManager::new(config.mem_fraction, config.reserve_gb));
        let workers = Arc::new(Workers::new(config.decode_threads, manager.epoch_ref()));
        Self::with_parts(config, manager, workers, decoder)
    }

    /// Engine decoding on the calling thread, for headless use and tests.
    pub fn inline(config: EngineConfig, decoder: Arc<dyn VideoDecoder>) -> Self {
        let manager = Arc::new(CacheManager::with_limit(INLINE_MEMORY_LIMIT));
        let workers = Arc::new(Workers::inline(manager.epoch_ref()));
        Self::with_parts(config.sanitize(), manager, workers, decoder)
    }

    pub fn with_parts(
        config: EngineConfig,
        manager: Arc<CacheManager>,
        workers: Arc<Workers>,
        decoder: Arc<dyn VideoDecoder>,
    ) -> Self {
        let bus = EventBus::new();
        let cache = FrameCache::new(&config, manager, Arc::clone(&workers), Arc::clone(&decoder), bus.clone());
        let registry = Arc::new(StreamRegistry::new(Arc::clone(&cache), decoder, &config));
        info!(
            "Timeline created: {} decode threads, {} lines per track, {} frames per buffer",
            workers.threads(),
            config.max_lines,
            config.frames_per_buffer
        );
        Self {
            solver: TrackSolver::new(&config),
            queue: SolveQueue::new("cutstrip-solver"),
            views: Mutex::new(HashMap::new()),
            registry,
            tick: AtomicU64::new(1),
            missed_tick: AtomicU64::new(0),
            audio: None,
            config,
            bus,
            cache,
            workers,
        }
    }

    pub fn with_audio(mut self, audio: Arc<dyn AudioEnvelopeProvider>) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cache(&self) -> &Arc<FrameCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn solver(&self) -> TrackSolver {
        self.solver
    }

    /// View of row `track`, created on first use.
    pub fn view(&self, track: i32) -> Arc<TrackView> {
        let mut views = self.views.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            views
                .entry(track)
                .or_insert_with(|| TrackView::new(track, &self.config, self.bus.clone())),
        )
    }

    pub fn remove_view(&self, track: i32) -> bool {
        self.views.lock().unwrap_or_else(|e| e.into_inner()).remove(&track).is_some()
    }

    /// Queue a solve of row `track` over `mapping`.
    ///
    /// Returns false when a solve of this row is already pending; the pending
    /// one will pick up the latest state on the next tick.
    pub fn solve(&self, scene: &Scene, track: i32, mapping: TimeMapping) -> bool {
        let view = self.view(track);
        if view.is_calculating() {
            return false;
        }
        let tree = Arc::new(scene.retained_for_track(track));
        let registry = Arc::clone(&self.registry);
        let row_height = self.config.row_height;
        view.request_solve(&self.queue, self.solver, tree, mapping, move |solution| {
            registry.claim(solution, row_height)
        })
    }

    /// Solve row `track` on the calling thread.
    pub fn solve_now(&self, scene: &Scene, track: i32, mapping: TimeMapping) -> Arc<StripeSolution> {
        let view = self.view(track);
        let solution = view.solve_now(&self.solver, Arc::new(scene.retained_for_track(track)), mapping);
        self.registry.claim(&solution, self.config.row_height);
        solution
    }

    /// Per-tick entry point: solve only when `trigger` asks for it or the
    /// scene changed since the installed solution.
    pub fn solve_if_needed(&self, scene: &Scene, track: i32, mapping: TimeMapping, trigger: &SolveTrigger) -> bool {
        let trigger = SolveTrigger { scene_revision: Some(scene.revision()), ..*trigger };
        if !self.view(track).needs_solve(&trigger) {
            return false;
        }
        self.solve(scene, track, mapping)
    }

    /// Wait for queued solves and decodes to finish.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if !self.queue.wait_idle(timeout) {
            return false;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        self.workers.wait_idle(left)
    }

    /// Start a new draw tick. Preview decodes are throttled per tick.
    pub fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Preview frame of `node` at global `time`, at most `max_width` wide.
    ///
    /// Never decodes on the caller: a miss queues the buffer and returns
    /// `Pending`. After the first miss of a tick, later previews of the same
    /// tick only look at the cache.
    pub fn frame_preview(&self, scene: &Scene, node: NodeId, time: f64, max_width: u32) -> FrameLookup {
        let Some(source) = scene.get(node).and_then(|n| n.content.media().filter(|_| n.content.has_video_content()))
        else {
            return FrameLookup::Missing;
        };
        match scene.evaluate(node, time) {
            Some(sample) => self.preview(source, sample.time, max_width),
            None => FrameLookup::Missing,
        }
    }

    fn preview(&self, source: &MediaSource, local_time: f64, max_width: u32) -> FrameLookup {
        let meta = &source.meta;
        let fps = meta.fps;
        if !(fps > 0.0) || !(local_time >= 0.0) {
            return FrameLookup::Missing;
        }
        let duration = source.duration();
        let plays_once = source.loop_mode == LoopMode::PlayOnce && !source.stay_visible_at_end;
        if plays_once && local_time > duration {
            return FrameLookup::Missing;
        }

        let raw = (meta.width / max_width.max(1)) as i32;
        let zoom = cacheable_zoom_level(raw).max(1);
        let count = ((duration * fps).round() as i64).max(1);
        let t = source.loop_mode.apply(local_time, duration);
        let frame_index = ((t * fps) as i64).clamp(0, count - 1);
        let key = FrameCacheKey::for_frame(source.source_id, zoom, frame_index, 1, fps);

        let tick = self.tick.load(Ordering::Acquire);
        if self.missed_tick.load(Ordering::Acquire) == tick {
            return self.cache.lookup(&key, frame_index);
        }
        let result = self.cache.get_frame(source, key, frame_index);
        if !result.is_ready() {
            self.missed_tick.store(tick, Ordering::Release);
        }
        result
    }

    /// Frame of `node` at global time for playback or export.
    ///
    /// With `ctx.final_render` a frame that can never arrive is an error;
    /// interactively the last drawn frame stands in for it.
    pub fn frame_at(
        &self,
        scene: &Scene,
        node: NodeId,
        global_time: f64,
        ctx: StreamContext,
        zoom: i32,
    ) -> CutstripResult<FrameLookup> {
        let scene_node = scene.get(node).ok_or(CutstripError::UnknownNode(node))?;
        let Some(source) = scene_node.content.media().filter(|_| scene_node.content.has_video_content()) else {
            return Ok(FrameLookup::Missing);
        };
        let local = scene.evaluate(node, global_time).ok_or(CutstripError::UnknownNode(node))?.time;
        let fps = source.playback_fps(ctx.final_render);
        let t = source.loop_mode.apply(local, source.duration());
        let frame_index = (t * fps).floor() as i64;
        let ctx = ctx.with_chain_of(scene, node);
        self.registry.with_manager(source, |manager| manager.resolve_frame(&ctx, zoom, frame_index, fps))
    }

    /// Draw context wired to this engine's caches and settings.
    pub fn draw_context(&self, y: i32, h: i32, central_time: f64) -> DrawContext<'_> {
        DrawContext {
            thumbnails: Some(self as &dyn ThumbnailSource),
            audio: self.audio.as_deref(),
            show_frame_status: self.config.show_frame_status,
            relative_video_border: self.config.relative_video_border,
            ..DrawContext::new(y, h, central_time)
        }
    }

    /// Draw the installed solution of `track`. False if there is none yet.
    pub fn draw(&self, track: i32, painter: &mut dyn Painter, ctx: &DrawContext<'_>) -> bool {
        match self.view(track).solution() {
            Some(solution) => {
                solution.draw(painter, ctx);
                true
            }
            None => false,
        }
    }

    /// Top-most node drawn at `(x, y)` in row `track`.
    pub fn node_at(&self, track: i32, x: f64, y: i32, row_y: i32, row_h: i32, central_time: f64) -> Option<NodeId> {
        self.view(track).node_at(x, y, row_y, row_h, central_time)
    }

    /// Drop everything cached for a source whose file changed.
    pub fn invalidate(&self, source_id: Uuid) {
        info!("Invalidating source {}", source_id);
        self.registry.remove(source_id);
        self.cache.invalidate(source_id);
    }

    /// Scene edited: every row solves again on its next tick.
    pub fn invalidate_views(&self) {
        let views = self.views.lock().unwrap_or_else(|e| e.into_inner());
        for view in views.values() {
            view.invalidate();
        }
        debug!("Invalidated {} track views", views.len());
    }

    /// Evict idle buffers. Call once per tick or on a timer.
    pub fn maintain(&self) -> usize {
        self.cache.maintain()
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.cache.stats()
    }
}

impl ThumbnailSource for Timeline {
    fn thumbnail(&self, source: &MediaSource, local_time: f64, width: u32) -> FrameLookup {
        // buffers claimed by the last solve
        let fps = source.playback_fps(false);
        if fps > 0.0 && local_time >= 0.0 {
            let zoom = thumbnail_zoom(source, width);
            let frame_index = source.frame_index_at(local_time, fps);
            let key =
                FrameCacheKey::for_frame(source.source_id, zoom, frame_index, self.config.frames_per_buffer, fps);
            if let ready @ FrameLookup::Ready(_) = self.cache.lookup(&key, frame_index) {
                return ready;
            }
        }
        self.preview(source, local_time, width)
    }

    fn readiness(
        &self,
        source: &MediaSource,
        fps: f64,
        x0: i32,
        x1: i32,
        time_at: &dyn Fn(i32) -> f64,
    ) -> Vec<StatusRun> {
        self.registry.with_existing(source.source_id, |streams| {
            let sources = ReadinessSources { cache: &*self.cache, streams };
            readiness_strip(
                &sources,
                source,
                fps,
                self.config.frames_per_buffer,
                self.config.max_status_scale as i32,
                x0,
                x1,
                time_at,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decoder::SyntheticDecoder;
    use crate::entities::{NodeContent, SceneNode, SourceMeta};

    fn video_scene() -> (Scene, NodeId, MediaSource) {
        let mut scene = Scene::new();
        let source = MediaSource::new("clip.mp4", SourceMeta::video(160, 90, 10.0, 100));
        let id = scene
            .attach(scene.root(), SceneNode::new("clip").with_track(0).with_content(NodeContent::Video(source.clone())))
            .expect("attach");
        (scene, id, source)
    }

    #[test]
    fn test_preview_ready_with_inline_workers() {
        let timeline = Timeline::inline(EngineConfig::default(), Arc::new(SyntheticDecoder::new()));
        let (scene, id, _) = video_scene();
        let frame = timeline.frame_preview(&scene, id, 2.55, 80);
        assert_eq!(frame.frame().map(|f| f.frame_index()), Some(25));
    }

    #[test]
    fn test_preview_outside_clip_is_missing() {
        let timeline = Timeline::inline(EngineConfig::default(), Arc::new(SyntheticDecoder::new()));
        let (scene, id, _) = video_scene();
        assert!(matches!(timeline.frame_preview(&scene, id, -1.0, 80), FrameLookup::Missing));
        assert!(matches!(timeline.frame_preview(&scene, id, 10.5, 80), FrameLookup::Missing));
    }

    #[test]
    fn test_preview_throttled_after_miss() {
        let decoder = SyntheticDecoder::new().with_broken_frames([3]);
        let timeline = Timeline::inline(EngineConfig::default(), Arc::new(decoder));
        let (scene, id, _) = video_scene();
        // failed decode: a miss for this tick
        assert!(!timeline.frame_preview(&scene, id, 0.3, 80).is_ready());
        // same tick: cache only, nothing new decoded
        assert!(!timeline.frame_preview(&scene, id, 5.0, 80).is_ready());
        timeline.next_tick();
        assert!(timeline.frame_preview(&scene, id, 5.0, 80).is_ready());
    }

    #[test]
    fn test_solve_now_draws_through_engine() {
        let timeline = Timeline::inline(EngineConfig::default(), Arc::new(SyntheticDecoder::new()));
        let (scene, _, _) = video_scene();
        let mut painter = RecordingPainter::new();
        let ctx = timeline.draw_context(0, 45, 5.0);
        assert!(!timeline.draw(0, &mut painter, &ctx));

        timeline.solve_now(&scene, 0, TimeMapping::from_window(0.0, 10.0, 0, 400));
        assert!(timeline.draw(0, &mut painter, &ctx));
        // claimed buffers were decoded inline, so thumbnails are textured
        assert!(painter.frames().count() > 0);
    }

    #[test]
    fn test_async_solve_installs_solution() {
        let timeline = Timeline::inline(EngineConfig::default(), Arc::new(SyntheticDecoder::new()));
        let (scene, _, _) = video_scene();
        timeline.solve(&scene, 0, TimeMapping::from_window(0.0, 10.0, 0, 100));
        assert!(timeline.wait_idle(Duration::from_secs(5)));
        let solution = timeline.view(0).solution().expect("installed");
        assert_eq!(solution.segment_count(), 1);
    }

    #[test]
    fn test_invalidate_marks_views_dirty() {
        let timeline = Timeline::inline(EngineConfig::default(), Arc::new(SyntheticDecoder::new()));
        let (scene, _, source) = video_scene();
        let mapping = TimeMapping::from_window(0.0, 10.0, 0, 100);
        timeline.solve_now(&scene, 0, mapping);
        let trigger = SolveTrigger { x0: 0, x1: 100, ..SolveTrigger::default() };
        assert!(!timeline.view(0).needs_solve(&trigger));

        timeline.invalidate(source.source_id);
        assert!(!timeline.cache().has_source(source.source_id));
        assert!(timeline.view(0).needs_solve(&trigger));
    }

    #[test]
    fn test_scene_edit_triggers_resolve() {
        let timeline = Timeline::inline(EngineConfig::default(), Arc::new(SyntheticDecoder::new()));
        let (mut scene, id, _) = video_scene();
        let mapping = TimeMapping::from_window(0.0, 10.0, 0, 100);
        timeline.solve_now(&scene, 0, mapping);
        let trigger = SolveTrigger { x0: 0, x1: 100, ..SolveTrigger::default() };
        assert!(!timeline.solve_if_needed(&scene, 0, mapping, &trigger));

        scene
            .edit(id, |n| n.color = crate::entities::AnimatedValue::constant(glam::Vec4::new(1.0, 0.0, 0.0, 1.0)))
            .expect("edit");
        assert!(timeline.solve_if_needed(&scene, 0, mapping, &trigger));
        assert!(timeline.wait_idle(Duration::from_secs(5)));
        let solution = timeline.view(0).solution().expect("installed");
        assert_eq!(solution.revision(), scene.revision());
    }
}
