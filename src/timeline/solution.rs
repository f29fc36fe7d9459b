//! Stripe solution: the compressed, drawable result of one track solve.
//!
//! Drawing never blocks. Thumbnails and audio levels come from non-blocking
//! sources; anything not resident yet is drawn as the flat gradient and the
//! owning cache pushes a redraw once it arrives.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::decoder::AudioEnvelopeProvider;
use crate::core::frame_cache::FrameLookup;
use crate::core::readiness::StatusRun;
use crate::entities::color::{mix_argb, with_alpha};
use crate::entities::{LoopMode, MediaSource, NodeId, RetainedTree, SceneNode};
use crate::timeline::gradient::GradientSegment;
use crate::timeline::mapping::TimeMapping;
use crate::timeline::paint::Painter;

const STRIPE_STRIDE: i32 = 5;
const STRIPE_COLOR_SELECTED: u32 = 0x33ff_ffff;
const STRIPE_COLOR_ERROR: u32 = 0xffff_7777;
const GREEN_YELLOW: u32 = 0xffad_ff2f;
const BLACK: u32 = 0xff00_0000;

/// Envelope buckets per audio request, one per pixel column.
pub const AUDIO_BUCKETS: usize = 256;

/// Vertical layout of stacked lines inside a row.
pub(crate) const LINE_TOP: i32 = 3;
pub(crate) const LINE_SPACING: i32 = 3;
pub(crate) const LINE_BOTTOM_MARGIN: i32 = 10;

/// Local time range of a video clip seen by a solve, for thumbnail prefetch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThumbnailClaim {
    pub node: NodeId,
    pub min_t: f64,
    pub max_t: f64,
}

/// Non-blocking frame access for the draw path.
pub trait ThumbnailSource {
    /// Frame for `local_time`, at most `width` pixels wide.
    fn thumbnail(&self, source: &MediaSource, local_time: f64, width: u32) -> FrameLookup;

    /// Readiness runs for the debug strip over columns `[x0, x1)`.
    fn readiness(
        &self,
        source: &MediaSource,
        fps: f64,
        x0: i32,
        x1: i32,
        time_at: &dyn Fn(i32) -> f64,
    ) -> Vec<StatusRun> {
        let _ = (source, fps, x0, x1, time_at);
        Vec::new()
    }
}

/// Editor state the draw path needs, passed explicitly.
#[derive(Clone, Copy)]
pub struct DrawContext<'a> {
    /// Row rectangle
    pub y: i32,
    pub h: i32,
    /// Central time now; differs from the solve's while panning
    pub central_time: f64,
    pub selected: &'a [NodeId],
    pub dragged: Option<NodeId>,
    pub thumbnails: Option<&'a dyn ThumbnailSource>,
    pub audio: Option<&'a dyn AudioEnvelopeProvider>,
    /// Debug strip height, 0 = off
    pub show_frame_status: u32,
    pub relative_video_border: f64,
}

impl<'a> DrawContext<'a> {
    pub fn new(y: i32, h: i32, central_time: f64) -> Self {
        Self {
            y,
            h,
            central_time,
            selected: &[],
            dragged: None,
            thumbnails: None,
            audio: None,
            show_frame_status: 0,
            relative_video_border: 0.1,
        }
    }
}

impl std::fmt::Debug for DrawContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrawContext")
            .field("y", &self.y)
            .field("h", &self.h)
            .field("central_time", &self.central_time)
            .field("selected", &self.selected.len())
            .field("dragged", &self.dragged)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct StripeSolution {
    mapping: TimeMapping,
    pub lines: Vec<Vec<GradientSegment>>,
    pub claims: Vec<ThumbnailClaim>,
    tree: Arc<RetainedTree>,
    owners: HashMap<NodeId, usize>,
}

/// Fields shared by every frame tile of one segment.
struct VideoTile<'s> {
    index: usize,
    source: &'s MediaSource,
    y: i32,
    h: i32,
    frame_offset: f64,
    frame_width: f64,
}

impl StripeSolution {
    pub fn new(mapping: TimeMapping, tree: Arc<RetainedTree>, max_lines: usize) -> Self {
        let width = (mapping.width() / 2).max(1) as usize;
        let owners = tree.drawn.iter().map(|&i| (tree.nodes[i].id, i)).collect();
        Self {
            mapping,
            lines: (0..max_lines.max(1)).map(|_| Vec::with_capacity(width)).collect(),
            claims: Vec::new(),
            tree,
            owners,
        }
    }

    pub fn mapping(&self) -> &TimeMapping {
        &self.mapping
    }

    pub fn x0(&self) -> i32 {
        self.mapping.x0
    }

    pub fn x1(&self) -> i32 {
        self.mapping.x1
    }

    /// Central time the solve was computed at.
    pub fn reference_time(&self) -> f64 {
        self.mapping.central_time
    }

    pub fn track_index(&self) -> i32 {
        self.tree.track_index
    }

    pub fn revision(&self) -> u64 {
        self.tree.revision
    }

    pub fn tree(&self) -> &Arc<RetainedTree> {
        &self.tree
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<SceneNode>> {
        self.owners.get(&id).map(|&i| &self.tree.nodes[i])
    }

    pub fn segments(&self) -> impl Iterator<Item = &GradientSegment> {
        self.lines.iter().flatten()
    }

    pub fn segment_count(&self) -> usize {
        self.lines.iter().map(Vec::len).sum()
    }

    /// Node-local time of a drawn node at global time `t`.
    fn local_time_of(&self, index: usize, global_time: f64) -> f64 {
        self.tree.sample_of(index, global_time).time
    }

    pub fn draw(&self, painter: &mut dyn Painter, ctx: &DrawContext<'_>) {
        let scale = self.mapping.time_scale();
        let x_time_correction = ((self.reference_time() - ctx.central_time) * scale).round() as i32;
        let time_offset = -ctx.central_time * scale;
        let h0 = ctx.h - LINE_BOTTOM_MARGIN;

        for (line_index, line) in self.lines.iter().enumerate() {
            let y0 = ctx.y + LINE_TOP + line_index as i32 * LINE_SPACING;
            for gradient in line {
                self.draw_gradient(painter, ctx, gradient, x_time_correction, y0, h0, time_offset);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_gradient(
        &self,
        painter: &mut dyn Painter,
        ctx: &DrawContext<'_>,
        gradient: &GradientSegment,
        x_time_correction: i32,
        y0: i32,
        h0: i32,
        time_offset: f64,
    ) {
        // segments touching a view edge stay bound to it
        let ix0 = if gradient.x0 == self.x0() { self.x0() } else { gradient.x0 + x_time_correction };
        let ix1 = if gradient.x1 + 1 >= self.x1() {
            self.x1()
        } else {
            gradient.x1 + x_time_correction + 1
        };
        if ix1 <= ix0 {
            return;
        }

        let Some(&index) = self.owners.get(&gradient.owner) else {
            painter.gradient(ix0, y0, ix1 - ix0, ctx.h, gradient.c0, gradient.c1);
            return;
        };
        let node = &self.tree.nodes[index];
        let has_video = node.content.has_video_content();
        let has_audio = node.content.has_audio_content();

        match node.content.media() {
            Some(source) if has_video => {
                self.draw_video(painter, ctx, gradient, index, source, y0, h0, time_offset, ix0, ix1)
            }
            _ => painter.gradient(ix0, y0, ix1 - ix0, ctx.h, gradient.c0, gradient.c1),
        }

        if let (true, Some(source)) = (has_audio, node.content.media()) {
            self.draw_audio(painter, ctx, index, source, has_video, ix0, ix1);
        }

        let has_error = node.last_warning.is_some();
        if has_error || ctx.dragged == Some(node.id) {
            let color = if has_error { STRIPE_COLOR_ERROR } else { STRIPE_COLOR_SELECTED };
            painter.striped(ix0, y0, ix1 - ix0, h0, time_offset as i32, STRIPE_STRIDE, color);
        }

        if ctx.selected.contains(&node.id) {
            let h1 = if has_video { h0 } else { ctx.h - 3 };
            painter.rect(ix0, y0, ix1 - ix0, h1, with_alpha(GREEN_YELLOW, 90));
        }
    }

    /// Video clips are tiled with thumbnails on a grid that moves with time.
    #[allow(clippy::too_many_arguments)]
    fn draw_video(
        &self,
        painter: &mut dyn Painter,
        ctx: &DrawContext<'_>,
        gradient: &GradientSegment,
        index: usize,
        source: &MediaSource,
        y0: i32,
        h0: i32,
        time_offset: f64,
        ix0: i32,
        ix1: i32,
    ) {
        let (c0, c1) = (gradient.c0, gradient.c1);
        let meta = &source.meta;
        let border = ctx.relative_video_border;
        let frame_width = ctx.h as f64 * (1.0 + border) * meta.width as f64 / meta.height.max(1) as f64;
        if !(frame_width >= 1.0) {
            painter.gradient(ix0, y0, ix1 - ix0, ctx.h, c0, c1);
            return;
        }

        let frame_offset = time_offset.rem_euclid(frame_width);
        let frame_index0 = ((ix0 as f64 - frame_offset) / frame_width).floor() as i64;
        let frame_index1 = ((ix1 as f64 - frame_offset) / frame_width).floor() as i64;

        let fraction = |x: i32, allow0: bool| {
            let lx = (x as f64 + frame_width - frame_offset).rem_euclid(frame_width);
            if lx == 0.0 && !allow0 { 1.0 } else { lx / frame_width }
        };
        let lerped = |x: f64| mix_argb(c0, c1, ((x - ix0 as f64) / gradient.w as f64) as f32);
        let tile = VideoTile { index, source, y: y0, h: h0, frame_offset, frame_width };

        if frame_index0 == frame_index1 {
            let (f0, f1) = (fraction(ix0, true), fraction(ix1, false));
            self.draw_tile(painter, ctx, &tile, ix0, ix1, c0, c1, f0, f1);
            return;
        }

        for frame_index in frame_index0 + 1..frame_index1 {
            let x0 = frame_width * frame_index as f64 + frame_offset;
            let x1 = x0 + frame_width;
            self.draw_tile(painter, ctx, &tile, x0 as i32, x1 as i32, lerped(x0), lerped(x1), 0.0, 1.0);
        }

        let first_end = (frame_index0 + 1) as f64 * frame_width + frame_offset;
        if first_end > ix0 as f64 {
            let f0 = fraction(ix0, true);
            self.draw_tile(painter, ctx, &tile, ix0, first_end as i32, c0, lerped(first_end - 1.0), f0, 1.0);
        }

        let last_start = frame_index1 as f64 * frame_width + frame_offset;
        if last_start < ix1 as f64 {
            let f1 = fraction(ix1, false);
            self.draw_tile(painter, ctx, &tile, last_start as i32, ix1, lerped(last_start), c1, 0.0, f1);
        }
    }

    /// One thumbnail tile `[x0, x1)` showing fraction `f0..f1` of its frame.
    #[allow(clippy::too_many_arguments)]
    fn draw_tile(
        &self,
        painter: &mut dyn Painter,
        ctx: &DrawContext<'_>,
        tile: &VideoTile<'_>,
        x0: i32,
        x1: i32,
        c0: u32,
        c1: u32,
        fract0: f64,
        fract1: f64,
    ) {
        let border = ctx.relative_video_border;
        let u0 = fract0 * (1.0 + border) - border * 0.5;
        let u1 = fract1 * (1.0 + border) - border * 0.5;
        let view = self.mapping.with_central_time(ctx.central_time);
        let (y, h) = (tile.y, tile.h);

        let frame = match ctx.thumbnails {
            Some(thumbnails) if u1 > 0.0 && u0 < 1.0 => {
                let center_x = x0 as f64 - (x0 as f64 - tile.frame_offset).rem_euclid(tile.frame_width)
                    + tile.frame_width * 0.5;
                let local = clamp_time(self.local_time_of(tile.index, view.time_at(center_x)), tile.source);
                let video_width = (tile.frame_width / (1.0 + border)) as u32;
                thumbnails.thumbnail(tile.source, local, video_width).into_frame()
            }
            _ => None,
        };
        match frame {
            Some(frame) if frame.is_created() => {
                painter.textured_gradient(x0, y, x1 - x0, h, c0, c1, &frame, u0 as f32, u1 as f32)
            }
            _ => painter.gradient(x0, y, x1 - x0, h, c0, c1),
        }

        let size = ctx.show_frame_status as i32;
        let Some(thumbnails) = ctx.thumbnails else { return };
        if size <= 0 {
            return;
        }
        let fps = tile.source.playback_fps(false);
        let time_at = |x: i32| clamp_time(self.local_time_of(tile.index, view.time_at(x as f64)), tile.source);
        for run in thumbnails.readiness(tile.source, fps, x0, x1, &time_at) {
            painter.rect(run.x0, y + h - size, run.x1 - run.x0, size, run.status.color());
        }
    }

    /// Min/max level bars, one per pixel column.
    #[allow(clippy::too_many_arguments)]
    fn draw_audio(
        &self,
        painter: &mut dyn Painter,
        ctx: &DrawContext<'_>,
        index: usize,
        source: &MediaSource,
        has_video: bool,
        ix0: i32,
        ix1: i32,
    ) {
        let Some(provider) = ctx.audio else { return };
        let h = ctx.h as f32;

        let base = if has_video { 0xaa77_7777 } else { 0xff77_7777 };
        let fine = mix_argb(base, 0x0077_ff77, 0.5) | BLACK;
        let ok = mix_argb(base, 0x00ff_ff77, 0.5) | BLACK;
        let critical = mix_argb(base, 0x00ff_7777, 0.5) | BLACK;

        let offset = if has_video { 0.75 } else { 0.5 } * h;
        let scale = if has_video { h / 128e3 } else { h / 65e3 };

        let view = self.mapping.with_central_time(ctx.central_time);
        let t_start = view.time_at(ix0 as f64);
        let dt = view.time_at((ix0 + AUDIO_BUCKETS as i32) as f64) - t_start;
        if !(dt > 0.0) {
            return;
        }
        let first = (t_start / dt).floor() as i64;
        let last = (view.time_at(ix1 as f64) / dt).ceil() as i64;

        for time_index in first..last {
            let t0 = time_index as f64 * dt;
            let t1 = t0 + dt;
            let xi = view.x_at(t0).round() as i32;
            let lt0 = self.local_time_of(index, t0);
            let lt1 = self.local_time_of(index, t1);
            let Some(levels) = provider.envelope(source, lt0, lt1, AUDIO_BUCKETS) else {
                continue;
            };
            for (dx, &(min_v, max_v)) in levels.iter().enumerate().take(AUDIO_BUCKETS) {
                let x = xi + dx as i32;
                if !(ix0..ix1).contains(&x) {
                    continue;
                }
                let amplitude = (min_v as i32).abs().max((max_v as i32).abs());
                let color = match amplitude {
                    a if a < 5_000 => BLACK,
                    a if a < 28_000 => fine,
                    a if a < 32_000 => ok,
                    _ => critical,
                };
                let lo = min_v as f32 * scale + offset;
                let hi = max_v as f32 * scale + offset;
                if hi < lo {
                    continue;
                }
                let y01 = ctx.y + lo as i32;
                let y11 = ctx.y + hi as i32;
                painter.rect(x, y01, 1, y11 + 1 - y01, color);
            }
        }
    }
}

/// Play-once clips hold their first and last frame outside their duration.
fn clamp_time(local_time: f64, source: &MediaSource) -> f64 {
    if source.loop_mode == LoopMode::PlayOnce {
        local_time.clamp(0.0, source.duration().max(0.0))
    } else {
        local_time
    }
}
