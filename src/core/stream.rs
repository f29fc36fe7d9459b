//! Sequential decode stream for forward playback.
//!
//! A `VideoStream` owns one decode thread that walks the source forward from
//! a start frame and keeps a small window of decoded frames. The render thread
//! only ever reads that window ([`VideoStream::get_frame`] never blocks) and
//! steers the thread through a command channel: demand (how far ahead to
//! decode) and seek (restart at another frame).
//!
//! The thread stops on [`VideoStream::destroy`], on drop, at end of source
//! errors, or when nobody asked for a frame during the idle timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, trace, warn};
use uuid::Uuid;

use crate::core::decoder::{FrameSequence, VideoDecoder};
use crate::entities::{DecodedFrame, MediaSource};

/// Window and lifetime of a stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Decoded frames kept in memory
    pub capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self { capacity: 32, idle_timeout: Duration::from_millis(2000) }
    }
}

enum Command {
    /// Decode at least up to this frame
    Demand(i64),
    /// Restart at frame, tagging frames with the new generation
    Seek(i64, u64),
    Stop,
}

#[derive(Debug)]
struct Window {
    frames: VecDeque<DecodedFrame>,
    /// Next frame the thread will produce
    cursor: i64,
    generation: u64,
    last_access: Instant,
    finished: bool,
}

#[derive(Debug)]
struct Shared {
    window: Mutex<Window>,
    alive: AtomicBool,
}

#[derive(Debug)]
pub struct VideoStream {
    source_id: Uuid,
    zoom: i32,
    fps: f64,
    options: StreamOptions,
    shared: Arc<Shared>,
    commands: Sender<Command>,
    handle: Option<thread::JoinHandle<()>>,
}

impl VideoStream {
    /// Open a stream at `start_frame` and start decoding in the background.
    pub fn start(
        decoder: Arc<dyn VideoDecoder>,
        source: &MediaSource,
        zoom: i32,
        fps: f64,
        start_frame: i64,
        options: StreamOptions,
    ) -> Self {
        let zoom = zoom.max(1);
        let longest = source.meta.width.max(source.meta.height);
        let max_size = longest.div_ceil(zoom as u32).max(1);
        let start_frame = start_frame.max(0);

        let shared = Arc::new(Shared {
            window: Mutex::new(Window {
                frames: VecDeque::with_capacity(options.capacity),
                cursor: start_frame,
                generation: 0,
                last_access: Instant::now(),
                finished: false,
            }),
            alive: AtomicBool::new(true),
        });
        let (tx, rx) = unbounded();

        let worker = DecodeLoop {
            decoder,
            source: source.clone(),
            max_size,
            fps,
            options,
            shared: Arc::clone(&shared),
            commands: rx,
        };
        let spawned = thread::Builder::new()
            .name(format!("cutstrip-stream-{}", &source.source_id.to_string()[..8]))
            .spawn(move || worker.run(start_frame));
        let handle = match spawned {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("Failed to spawn stream thread for {}: {}", source.path, e);
                shared.alive.store(false, Ordering::Release);
                None
            }
        };

        debug!(
            "Stream created: {} z{} @{} fps from frame {} (max size {})",
            source.path, zoom, fps, start_frame, max_size
        );
        Self {
            source_id: source.source_id,
            zoom,
            fps,
            options,
            shared,
            commands: tx,
            handle,
        }
    }

    pub fn source_id(&self) -> Uuid {
        self.source_id
    }

    pub fn zoom(&self) -> i32 {
        self.zoom
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Same source, zoom and rate.
    pub fn matches(&self, source_id: Uuid, zoom: i32, fps: f64) -> bool {
        self.source_id == source_id && self.zoom == zoom.max(1) && self.fps == fps
    }

    /// False once the decode thread has exited.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Frame `index` if decoded, otherwise the closest earlier decoded frame.
    ///
    /// Never blocks. Asks the thread to decode up to `index + lookahead`, and
    /// seeks when `index` is outside the reachable window.
    pub fn get_frame(&self, index: i64, lookahead: i64) -> Option<DecodedFrame> {
        let mut window = self.shared.window.lock().unwrap_or_else(|e| e.into_inner());
        window.last_access = Instant::now();

        let window_start = window.frames.front().map_or(window.cursor, |f| f.frame_index());
        let reach = window.cursor + self.options.capacity as i64;
        if index < window_start || index > reach {
            window.generation += 1;
            window.frames.clear();
            window.cursor = index;
            window.finished = false;
            trace!("Stream {} seeking to {}", self.source_id, index);
            let _ = self.commands.send(Command::Seek(index, window.generation));
            return None;
        }
        let _ = self.commands.send(Command::Demand(index + lookahead.max(0)));

        window
            .frames
            .iter()
            .rev()
            .find(|f| f.frame_index() <= index)
            .cloned()
    }

    /// Decoded frames in `[from, to]`, without touching demand or seek.
    pub fn peek_range(&self, from: i64, to: i64) -> Vec<DecodedFrame> {
        let window = self.shared.window.lock().unwrap_or_else(|e| e.into_inner());
        window
            .frames
            .iter()
            .filter(|f| (from..=to).contains(&f.frame_index()))
            .cloned()
            .collect()
    }

    pub fn peek(&self, index: i64) -> Option<DecodedFrame> {
        self.peek_range(index, index).into_iter().next()
    }

    /// True when the source ran out of frames.
    pub fn is_finished(&self) -> bool {
        self.shared.window.lock().unwrap_or_else(|e| e.into_inner()).finished
    }

    /// Ask the thread to exit without waiting for it.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Stop the thread, wait for it and release every frame.
    pub fn destroy(&mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let mut window = self.shared.window.lock().unwrap_or_else(|e| e.into_inner());
        for f in window.frames.drain(..) {
            f.destroy();
        }
        self.shared.alive.store(false, Ordering::Release);
    }
}

impl Drop for VideoStream {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct DecodeLoop {
    decoder: Arc<dyn VideoDecoder>,
    source: MediaSource,
    max_size: u32,
    fps: f64,
    options: StreamOptions,
    shared: Arc<Shared>,
    commands: Receiver<Command>,
}

const IDLE_POLL: Duration = Duration::from_millis(10);

impl DecodeLoop {
    fn open(&self, frame: i64) -> Option<Box<dyn FrameSequence>> {
        match self.decoder.open_stream(&self.source, self.max_size, self.fps, frame) {
            Ok(seq) => Some(seq),
            Err(e) => {
                warn!("Cannot open stream for {}: {}", self.source.path, e);
                None
            }
        }
    }

    fn run(self, start_frame: i64) {
        let mut sequence = self.open(start_frame);
        let mut next = start_frame;
        let mut demand = start_frame;
        let mut generation = 0u64;

        loop {
            let wants_more = sequence.is_some() && next <= demand;
            let command = if wants_more {
                match self.commands.try_recv() {
                    Ok(c) => Some(c),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match self.commands.recv_timeout(IDLE_POLL) {
                    Ok(c) => Some(c),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };

            match command {
                Some(Command::Stop) => break,
                Some(Command::Demand(to)) => demand = demand.max(to),
                Some(Command::Seek(to, r#gen)) => {
                    generation = r#gen;
                    sequence = self.open(to);
                    next = to;
                    demand = to;
                }
                None => {}
            }

            let idle = {
                let window = self.shared.window.lock().unwrap_or_else(|e| e.into_inner());
                window.last_access.elapsed() > self.options.idle_timeout
            };
            if idle {
                debug!("Stream for {} idle, stopping", self.source.path);
                break;
            }

            if next > demand {
                continue;
            }
            let Some(seq) = sequence.as_mut() else {
                continue;
            };
            match seq.next_frame() {
                Ok(Some(frame)) => {
                    next = frame.frame_index() + 1;
                    self.push(frame, generation);
                }
                Ok(None) => {
                    self.finish(generation);
                    sequence = None;
                }
                Err(e) => {
                    warn!("Stream decode failed for {} at frame {}: {}", self.source.path, next, e);
                    self.finish(generation);
                    sequence = None;
                }
            }
        }

        let mut window = self.shared.window.lock().unwrap_or_else(|e| e.into_inner());
        for f in window.frames.drain(..) {
            f.destroy();
        }
        self.shared.alive.store(false, Ordering::Release);
        trace!("Stream thread for {} exited", self.source.path);
    }

    fn push(&self, frame: DecodedFrame, generation: u64) {
        let mut window = self.shared.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.generation != generation {
            frame.destroy();
            return;
        }
        window.cursor = frame.frame_index() + 1;
        window.frames.push_back(frame);
        while window.frames.len() > self.options.capacity {
            if let Some(old) = window.frames.pop_front() {
                old.destroy();
            }
        }
    }

    fn finish(&self, generation: u64) {
        let mut window = self.shared.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.generation == generation {
            window.finished = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decoder::SyntheticDecoder;
    use crate::entities::SourceMeta;

    fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(v) = f() {
                return Some(v);
            }
            thread::sleep(Duration::from_millis(2));
        }
        None
    }

    fn source() -> MediaSource {
        MediaSource::new("long.mp4", SourceMeta::video(1920, 1080, 25.0, 1000))
    }

    #[test]
    fn test_stream_decodes_forward() {
        let decoder = Arc::new(SyntheticDecoder::new());
        let stream = VideoStream::start(decoder.clone(), &source(), 4, 25.0, 100, StreamOptions::default());
        let f = wait_for(|| stream.get_frame(105, 7).filter(|f| f.frame_index() == 105)).expect("frame 105");
        assert_eq!(f.width(), 480);
        assert!(stream.matches(stream.source_id(), 4, 25.0));
        assert_eq!(decoder.streams_opened(), 1);
    }

    #[test]
    fn test_far_jump_seeks() {
        let decoder = Arc::new(SyntheticDecoder::new());
        let stream = VideoStream::start(decoder.clone(), &source(), 1, 25.0, 0, StreamOptions::default());
        wait_for(|| stream.get_frame(3, 7).filter(|f| f.frame_index() == 3)).expect("frame 3");
        // far beyond the window: first call seeks and returns nothing
        assert!(stream.get_frame(800, 7).is_none());
        let f = wait_for(|| stream.get_frame(800, 7).filter(|f| f.frame_index() == 800)).expect("frame 800");
        assert_eq!(f.frame_index(), 800);
        assert_eq!(decoder.streams_opened(), 2);
    }

    #[test]
    fn test_idle_stream_stops_and_destroy_releases_frames() {
        let options = StreamOptions { capacity: 8, idle_timeout: Duration::from_millis(30) };
        let mut stream = VideoStream::start(Arc::new(SyntheticDecoder::new()), &source(), 1, 25.0, 0, options);
        let f = wait_for(|| stream.get_frame(0, 2)).expect("frame 0");
        assert!(wait_for(|| (!stream.is_alive()).then_some(())).is_some());
        assert!(f.is_destroyed());
        stream.destroy();
        assert!(stream.peek_range(0, 100).is_empty());
    }
}
