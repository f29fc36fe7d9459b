//! Scene node - the time/color model evaluated by the timeline.
//!
//! Every node maps its parent's time into a local time and multiplies its own
//! color onto the parent's color. The timeline solver evaluates these two
//! functions for every retained node at every pixel column, so they must stay
//! cheap and side-effect free:
//!
//! ```text
//! base      = (parent_time - time_offset) * time_dilation     (0 if dilation == 0)
//! local     = base + time_warp(base)
//! color     = color(local) * parent_color                      (componentwise)
//! color.rgb *= color_multiplier(local)
//! color.a   *= fade(local)
//! ```
//!
//! Node content is a tagged union resolved once per node: plain nodes only
//! contribute color, media nodes also carry a [`MediaSource`] with looping and
//! visibility rules.

use glam::Vec4;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::keyframes::AnimatedValue;
use super::NodeId;

/// How a media clip behaves past its natural duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopMode {
    /// Visible for `0 <= t < duration`
    #[default]
    PlayOnce,
    /// Wraps with positive modulo
    Loop,
    /// Plays forward, then backward, then forward...
    PingPong,
}

impl LoopMode {
    /// Map local time into `[0, duration]` for the given mode.
    pub fn apply(self, time: f64, duration: f64) -> f64 {
        if !(duration > 0.0) || !duration.is_finite() {
            return time;
        }
        match self {
            LoopMode::PlayOnce => time,
            LoopMode::Loop => time.rem_euclid(duration),
            LoopMode::PingPong => {
                let t = time.rem_euclid(2.0 * duration);
                if t > duration { 2.0 * duration - t } else { t }
            }
        }
    }
}

/// Container metadata as reported by the decoder collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMeta {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: i64,
    /// Seconds.
    pub duration: f64,
    pub has_video: bool,
    pub has_audio: bool,
    pub audio_sample_rate: u32,
}

impl SourceMeta {
    pub fn video(width: u32, height: u32, fps: f64, frame_count: i64) -> Self {
        Self {
            width,
            height,
            fps,
            frame_count,
            duration: if fps > 0.0 { frame_count as f64 / fps } else { 0.0 },
            has_video: true,
            has_audio: false,
            audio_sample_rate: 0,
        }
    }

    pub fn audio(duration: f64, sample_rate: u32) -> Self {
        Self {
            width: 0,
            height: 0,
            fps: 0.0,
            frame_count: 0,
            duration,
            has_video: false,
            has_audio: true,
            audio_sample_rate: sample_rate,
        }
    }

    pub fn with_audio(mut self, sample_rate: u32) -> Self {
        self.has_audio = true;
        self.audio_sample_rate = sample_rate;
        self
    }
}

/// A media file referenced by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSource {
    /// Cache identity of the file. Changes when the file is replaced.
    pub source_id: Uuid,
    pub path: String,
    pub meta: SourceMeta,
    #[serde(default)]
    pub loop_mode: LoopMode,
    #[serde(default)]
    pub stay_visible_at_end: bool,
    /// Upper bound of the decode rate during interactive preview.
    #[serde(default = "default_editor_fps")]
    pub editor_fps: f64,
    /// > 0 enables skipping of blank frames.
    #[serde(default)]
    pub blank_frame_threshold: f32,
}

fn default_editor_fps() -> f64 {
    60.0
}

impl MediaSource {
    pub fn new(path: impl Into<String>, meta: SourceMeta) -> Self {
        Self {
            source_id: Uuid::new_v4(),
            path: path.into(),
            meta,
            loop_mode: LoopMode::PlayOnce,
            stay_visible_at_end: false,
            editor_fps: default_editor_fps(),
            blank_frame_threshold: 0.0,
        }
    }

    pub fn duration(&self) -> f64 {
        self.meta.duration
    }

    /// Media visibility rule: started, and either wrapping or not yet finished.
    pub fn is_visible(&self, local_time: f64) -> bool {
        local_time >= 0.0
            && (self.stay_visible_at_end
                || self.loop_mode != LoopMode::PlayOnce
                || local_time < self.duration())
    }

    /// Playback frame rate: source rate for final output, capped by the
    /// editor rate otherwise.
    pub fn playback_fps(&self, final_render: bool) -> f64 {
        if final_render {
            self.meta.fps
        } else {
            self.meta.fps.min(self.editor_fps)
        }
    }

    /// Frames available at `fps`, never less than one.
    pub fn frame_count_at(&self, fps: f64) -> i64 {
        let by_duration = (self.duration() * fps).round() as i64;
        by_duration.min(self.meta.frame_count).max(1)
    }

    /// Frame shown at node-local time, with looping applied.
    pub fn frame_index_at(&self, local_time: f64, fps: f64) -> i64 {
        let t = self.loop_mode.apply(local_time, self.duration());
        let count = self.frame_count_at(fps);
        ((t * fps).floor() as i64).clamp(0, count - 1)
    }

    /// End of visibility in local time.
    pub fn end_time(&self) -> f64 {
        match self.loop_mode {
            LoopMode::PlayOnce if !self.stay_visible_at_end => self.duration(),
            _ => f64::INFINITY,
        }
    }
}

/// Variant data of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum NodeContent {
    #[default]
    Plain,
    Video(MediaSource),
    Audio(MediaSource),
}

impl NodeContent {
    pub fn has_video_content(&self) -> bool {
        matches!(self, NodeContent::Video(m) if m.meta.has_video)
    }

    pub fn has_audio_content(&self) -> bool {
        match self {
            NodeContent::Video(m) | NodeContent::Audio(m) => m.meta.has_audio,
            NodeContent::Plain => false,
        }
    }

    pub fn media(&self) -> Option<&MediaSource> {
        match self {
            NodeContent::Video(m) | NodeContent::Audio(m) => Some(m),
            NodeContent::Plain => None,
        }
    }
}

/// One element of the scene tree.
///
/// Hierarchy links live in [`Scene`](super::Scene); the node itself only
/// carries its own attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneNode {
    pub id: NodeId,
    pub name: String,
    pub color: AnimatedValue<Vec4>,
    pub color_multiplier: AnimatedValue<f32>,
    pub fade_in: AnimatedValue<f32>,
    pub fade_out: AnimatedValue<f32>,
    pub time_offset: f64,
    pub time_dilation: f64,
    pub time_warp: AnimatedValue<f64>,
    pub start_time: f64,
    pub end_time: f64,
    /// `>= 0` assigns a timeline row, `< 0` hides the node from the timeline.
    pub track_index: i32,
    pub visible: bool,
    pub content: NodeContent,
    /// Set by the renderer when something went wrong with this node.
    #[serde(skip)]
    pub last_warning: Option<String>,
}

/// Per-node result of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeSample {
    pub time: f64,
    pub color: Vec4,
}

impl NodeSample {
    pub const ROOT: NodeSample = NodeSample { time: 0.0, color: Vec4::ONE };

    pub fn root(global_time: f64) -> Self {
        Self { time: global_time, color: Vec4::ONE }
    }
}

impl SceneNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            color: AnimatedValue::constant(Vec4::ONE),
            color_multiplier: AnimatedValue::constant(1.0),
            fade_in: AnimatedValue::constant(0.0),
            fade_out: AnimatedValue::constant(0.0),
            time_offset: 0.0,
            time_dilation: 1.0,
            time_warp: AnimatedValue::new(0.0),
            start_time: f64::NEG_INFINITY,
            end_time: f64::INFINITY,
            track_index: -1,
            visible: true,
            content: NodeContent::Plain,
            last_warning: None,
        }
    }

    pub fn with_track(mut self, track_index: i32) -> Self {
        self.track_index = track_index;
        self
    }

    pub fn with_color(mut self, color: impl Into<AnimatedValue<Vec4>>) -> Self {
        self.color = color.into();
        self
    }

    pub fn with_content(mut self, content: NodeContent) -> Self {
        self.content = content;
        self
    }

    pub fn with_time(mut self, offset: f64, dilation: f64) -> Self {
        self.time_offset = offset;
        self.time_dilation = dilation;
        self
    }

    pub fn with_fades(mut self, fade_in: f32, fade_out: f32) -> Self {
        self.fade_in = AnimatedValue::constant(fade_in);
        self.fade_out = AnimatedValue::constant(fade_out);
        self
    }

    pub fn with_range(mut self, start: f64, end: f64) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    /// Effective start in local time. Media never starts before 0.
    pub fn effective_start(&self) -> f64 {
        match self.content.media() {
            Some(_) => self.start_time.max(0.0),
            None => self.start_time,
        }
    }

    /// Effective end in local time, bounded by the media duration when the
    /// clip plays once.
    pub fn effective_end(&self) -> f64 {
        match self.content.media() {
            Some(m) => self.end_time.min(m.end_time()),
            None => self.end_time,
        }
    }

    /// Local time before the warp curve. Zero dilation freezes time at 0.
    #[inline]
    pub fn base_time(&self, parent_time: f64) -> f64 {
        if self.time_dilation == 0.0 {
            0.0
        } else {
            (parent_time - self.time_offset) * self.time_dilation
        }
    }

    #[inline]
    pub fn local_time(&self, parent_time: f64) -> f64 {
        let base = self.base_time(parent_time);
        base + self.time_warp.value_at(base)
    }

    /// Inverse of the linear part of [`local_time`](Self::local_time).
    pub fn to_global_time(&self, local_time: f64) -> f64 {
        if self.time_dilation == 0.0 {
            self.time_offset
        } else {
            local_time / self.time_dilation + self.time_offset
        }
    }

    /// Fade factor in [0, 1].
    pub fn fade(&self, local_time: f64) -> f32 {
        let fade_in = self.fade_in.value_at(local_time).max(0.0) as f64;
        let fade_out = self.fade_out.value_at(local_time).max(0.0) as f64;
        let m1 = fade_ratio(local_time - self.effective_start(), fade_in);
        let m2 = fade_ratio(self.effective_end() - local_time, fade_out);
        (m1 * m2) as f32
    }

    #[inline]
    pub fn local_color(&self, parent_color: Vec4, local_time: f64) -> Vec4 {
        let mut c = self.color.value_at(local_time) * parent_color;
        let mul = self.color_multiplier.value_at(local_time);
        c.x *= mul;
        c.y *= mul;
        c.z *= mul;
        c.w *= self.fade(local_time);
        c
    }

    /// Evaluate time and color given the parent's sample.
    #[inline]
    pub fn evaluate(&self, parent: NodeSample) -> NodeSample {
        let time = self.local_time(parent.time);
        NodeSample { time, color: self.local_color(parent.color, time) }
    }

    /// Visibility flag combined with the content's own rule.
    pub fn is_visible(&self, local_time: f64) -> bool {
        if !self.visible {
            return false;
        }
        match self.content.media() {
            Some(m) => m.is_visible(local_time),
            None => true,
        }
    }

    /// Upper bound of the node's own alpha over a local time range.
    ///
    /// Used to skip resource claims for clips that stay transparent.
    pub fn max_alpha_in(&self, t0: f64, t1: f64) -> f32 {
        let (t0, t1) = if t0 <= t1 { (t0, t1) } else { (t1, t0) };
        let mut probes = vec![t0, t1];
        probes.extend(self.color.range(t0, t1).iter().map(|k| k.time));
        let start = self.effective_start();
        let end = self.effective_end();
        let fade_in = self.fade_in.value_at(t0).max(0.0) as f64;
        let fade_out = self.fade_out.value_at(t1).max(0.0) as f64;
        for t in [start + fade_in, end - fade_out] {
            if t.is_finite() && t > t0 && t < t1 {
                probes.push(t);
            }
        }
        probes
            .into_iter()
            .map(|t| self.color.value_at(t).w * self.fade(t))
            .fold(0.0f32, f32::max)
    }

    /// True when the time warp actually varies with time.
    pub fn has_animated_time(&self) -> bool {
        self.time_warp.is_animated()
    }
}

/// `clamp(num / dur, 0, 1)` with a step at `dur == 0` and NaN treated as inside.
fn fade_ratio(num: f64, dur: f64) -> f64 {
    if num.is_nan() {
        return 1.0;
    }
    if dur <= 0.0 {
        return if num >= 0.0 { 1.0 } else { 0.0 };
    }
    (num / dur).clamp(0.0, 1.0)
}
