//! Decoder collaborators.
//!
//! The engine never decodes anything itself: buffers of frames come from a
//! [`VideoDecoder`], audio levels from an [`AudioEnvelopeProvider`]. Both are
//! called from worker threads (decoder) or the draw thread (envelope), so
//! implementations must be `Send + Sync` and the envelope query must not block.
//!
//! [`SyntheticDecoder`] and [`SyntheticAudio`] generate frames and levels
//! procedurally. They back hosts without a media backend and the test suites.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

use crate::entities::{DecodedFrame, MediaSource};
use crate::error::{CutstripError, CutstripResult};

/// One decode-buffer request: frames `[buffer_index * buffer_len, +buffer_len)`
/// of `source` at `fps`, downscaled by `zoom`.
#[derive(Debug, Clone)]
pub struct BufferRequest {
    pub source: MediaSource,
    pub zoom: i32,
    pub buffer_index: i64,
    pub buffer_len: i64,
    pub fps: f64,
}

impl BufferRequest {
    pub fn first_frame(&self) -> i64 {
        self.buffer_index * self.buffer_len
    }

    /// Frame size after downscaling, rounded up.
    pub fn scaled_size(&self) -> (u32, u32) {
        let z = self.zoom.max(1) as u32;
        (
            self.source.meta.width.div_ceil(z).max(1),
            self.source.meta.height.div_ceil(z).max(1),
        )
    }
}

/// Sequential frame source opened by [`VideoDecoder::open_stream`].
pub trait FrameSequence: Send {
    /// Next frame in decode order, `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> CutstripResult<Option<DecodedFrame>>;
}

/// Media decoder.
pub trait VideoDecoder: Send + Sync {
    /// Decode a whole buffer. May block; only called from decode workers.
    /// Frames past the end of the source are simply not returned.
    fn decode_buffer(&self, request: &BufferRequest) -> CutstripResult<Vec<DecodedFrame>>;

    /// Open a forward decoder starting at `start_frame`, frames no larger than
    /// `max_size` on their longest side.
    fn open_stream(
        &self,
        source: &MediaSource,
        max_size: u32,
        fps: f64,
        start_frame: i64,
    ) -> CutstripResult<Box<dyn FrameSequence>> {
        let _ = (max_size, fps, start_frame);
        Err(CutstripError::decode(format!("streaming not supported for {}", source.path)))
    }
}

/// Per-bucket (min, max) amplitudes of an audio source.
pub trait AudioEnvelopeProvider: Send + Sync {
    /// `buckets` samples covering `[t0, t1)` in source time, or `None` while
    /// the data is not loaded yet. Must not block.
    fn envelope(&self, source: &MediaSource, t0: f64, t1: f64, buckets: usize) -> Option<Vec<(i16, i16)>>;
}

/// Procedural decoder: every frame exists unless listed in `broken_frames`.
#[derive(Debug, Default)]
pub struct SyntheticDecoder {
    blank_frames: HashSet<i64>,
    broken_frames: HashSet<i64>,
    buffers_decoded: AtomicUsize,
    streams_opened: AtomicUsize,
}

impl SyntheticDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames that decode as visually blank.
    pub fn with_blank_frames(mut self, frames: impl IntoIterator<Item = i64>) -> Self {
        self.blank_frames.extend(frames);
        self
    }

    /// Frames whose buffer fails to decode.
    pub fn with_broken_frames(mut self, frames: impl IntoIterator<Item = i64>) -> Self {
        self.broken_frames.extend(frames);
        self
    }

    pub fn buffers_decoded(&self) -> usize {
        self.buffers_decoded.load(Ordering::SeqCst)
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    fn make_frame(&self, width: u32, height: u32, index: i64, buffer_len: i64) -> DecodedFrame {
        if self.blank_frames.contains(&index) {
            DecodedFrame::blank(width, height, index, buffer_len)
        } else {
            DecodedFrame::new(width, height, index, buffer_len)
        }
    }
}

impl VideoDecoder for SyntheticDecoder {
    fn decode_buffer(&self, request: &BufferRequest) -> CutstripResult<Vec<DecodedFrame>> {
        self.buffers_decoded.fetch_add(1, Ordering::SeqCst);

        let first = request.first_frame();
        let count = request.source.frame_count_at(request.fps);
        let range = first.max(0)..(first + request.buffer_len).min(count);
        if let Some(bad) = range.clone().find(|i| self.broken_frames.contains(i)) {
            return Err(CutstripError::decode(format!("{}: corrupt frame {}", request.source.path, bad)));
        }

        let (w, h) = request.scaled_size();
        trace!(
            "Synthetic decode {} z{} buffer {} ({} frames)",
            request.source.path,
            request.zoom,
            request.buffer_index,
            range.end - range.start
        );
        Ok(range.map(|i| self.make_frame(w, h, i, request.buffer_len)).collect())
    }

    fn open_stream(
        &self,
        source: &MediaSource,
        max_size: u32,
        fps: f64,
        start_frame: i64,
    ) -> CutstripResult<Box<dyn FrameSequence>> {
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        let longest = source.meta.width.max(source.meta.height).max(1);
        let scale = max_size.min(longest) as f64 / longest as f64;
        let width = ((source.meta.width as f64 * scale).round() as u32).max(1);
        let height = ((source.meta.height as f64 * scale).round() as u32).max(1);
        Ok(Box::new(SyntheticSequence {
            next: start_frame.max(0),
            end: source.frame_count_at(fps),
            width,
            height,
            blank: self.blank_frames.clone(),
        }))
    }
}

struct SyntheticSequence {
    next: i64,
    end: i64,
    width: u32,
    height: u32,
    blank: HashSet<i64>,
}

impl FrameSequence for SyntheticSequence {
    fn next_frame(&mut self) -> CutstripResult<Option<DecodedFrame>> {
        if self.next >= self.end {
            return Ok(None);
        }
        let i = self.next;
        self.next += 1;
        let frame = if self.blank.contains(&i) {
            DecodedFrame::blank(self.width, self.height, i, 1)
        } else {
            DecodedFrame::new(self.width, self.height, i, 1)
        };
        Ok(Some(frame))
    }
}

/// Sine-shaped levels with a fixed peak amplitude.
#[derive(Debug, Clone)]
pub struct SyntheticAudio {
    pub peak: i16,
    /// Oscillation frequency of the envelope in Hz.
    pub rate: f64,
    /// When false, every query reports "not loaded yet".
    pub loaded: bool,
}

impl Default for SyntheticAudio {
    fn default() -> Self {
        Self { peak: 20_000, rate: 1.0, loaded: true }
    }
}

impl AudioEnvelopeProvider for SyntheticAudio {
    fn envelope(&self, source: &MediaSource, t0: f64, t1: f64, buckets: usize) -> Option<Vec<(i16, i16)>> {
        if !self.loaded || !source.meta.has_audio {
            return None;
        }
        let dt = (t1 - t0) / buckets.max(1) as f64;
        Some(
            (0..buckets)
                .map(|i| {
                    let t = t0 + (i as f64 + 0.5) * dt;
                    if t < 0.0 || t >= source.duration() {
                        return (0, 0);
                    }
                    let level = ((t * self.rate * std::f64::consts::TAU).sin().abs() * self.peak as f64) as i16;
                    (-level, level)
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::SourceMeta;

    fn source() -> MediaSource {
        MediaSource::new("synthetic.mp4", SourceMeta::video(1920, 1080, 30.0, 300))
    }

    #[test]
    fn test_decode_buffer_stops_at_source_end() {
        let decoder = SyntheticDecoder::new();
        let req = BufferRequest { source: source(), zoom: 3, buffer_index: 2, buffer_len: 128, fps: 30.0 };
        let frames = decoder.decode_buffer(&req).expect("decode");
        assert_eq!(frames.len(), 300 - 256);
        assert_eq!(frames[0].frame_index(), 256);
        assert_eq!(frames[0].buffer_index(), 2);
        assert_eq!((frames[0].width(), frames[0].height()), (640, 360));
        assert_eq!(decoder.buffers_decoded(), 1);
    }

    #[test]
    fn test_broken_frame_fails_its_buffer() {
        let decoder = SyntheticDecoder::new().with_broken_frames([5]);
        let req = BufferRequest { source: source(), zoom: 1, buffer_index: 0, buffer_len: 128, fps: 30.0 };
        assert!(matches!(decoder.decode_buffer(&req), Err(CutstripError::Decode(_))));
        let req = BufferRequest { buffer_index: 1, ..req };
        assert!(decoder.decode_buffer(&req).is_ok());
    }

    #[test]
    fn test_stream_is_sequential() {
        let decoder = SyntheticDecoder::new().with_blank_frames([11]);
        let mut seq = decoder.open_stream(&source(), 480, 30.0, 10).expect("open");
        let a = seq.next_frame().expect("ok").expect("frame");
        let b = seq.next_frame().expect("ok").expect("frame");
        assert_eq!((a.frame_index(), b.frame_index()), (10, 11));
        assert!(b.is_blank());
        assert_eq!(a.width(), 480);
        assert_eq!(decoder.streams_opened(), 1);
    }

    #[test]
    fn test_envelope_not_ready_and_silence_outside() {
        let src = MediaSource::new("a.wav", SourceMeta::audio(2.0, 48_000));
        let mut audio = SyntheticAudio::default();
        let env = audio.envelope(&src, -1.0, 1.0, 4).expect("loaded");
        assert_eq!(env[0], (0, 0));
        assert!(env[3].1 > 0);
        audio.loaded = false;
        assert!(audio.envelope(&src, 0.0, 1.0, 4).is_none());
    }
}
