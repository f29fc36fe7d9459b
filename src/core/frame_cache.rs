//! Decoded-frame cache organised in decode buffers.
//!
//! Structure: `HashMap<source_id, HashMap<FrameCacheKey, BufferEntry>>`
//! - outer map: one entry per media source, so `invalidate(source)` is O(1)
//! - inner map: one entry per (zoom, buffer, buffer length, fps)
//! - `IndexSet` LRU over buffer keys, front = least recently used
//!
//! Lookups never block: a miss answers [`FrameLookup::Pending`] after
//! queueing a decode job on [`Workers`]. When the job finishes the buffer is
//! filled and [`BufferReady`] is emitted on the event bus, which is how views
//! learn that a redraw would now show more.
//!
//! Buffers are evicted when unused for longer than the buffer timeout
//! ([`FrameCache::maintain`]), when the number of buffers exceeds capacity and
//! when the [`CacheManager`] memory budget is exceeded.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use log::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::cache_man::CacheManager;
use crate::core::decoder::{BufferRequest, VideoDecoder};
use crate::core::event_bus::{BufferReady, EventBus, SourceInvalidated};
use crate::core::workers::Workers;
use crate::entities::{DecodedFrame, MediaSource};
use crate::error::CutstripResult;

/// Address of one decode buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCacheKey {
    pub source_id: Uuid,
    pub zoom: i32,
    pub buffer_index: i64,
    pub buffer_len: i64,
    fps_bits: u64,
}

impl Hash for FrameCacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source_id.hash(state);
        self.zoom.hash(state);
        self.buffer_index.hash(state);
        self.buffer_len.hash(state);
        self.fps_bits.hash(state);
    }
}

impl FrameCacheKey {
    pub fn new(source_id: Uuid, zoom: i32, buffer_index: i64, buffer_len: i64, fps: f64) -> Self {
        Self {
            source_id,
            zoom: zoom.max(1),
            buffer_index,
            buffer_len: buffer_len.max(1),
            fps_bits: fps.to_bits(),
        }
    }

    /// Key of the buffer holding `frame_index`.
    pub fn for_frame(source_id: Uuid, zoom: i32, frame_index: i64, buffer_len: i64, fps: f64) -> Self {
        let buffer_len = buffer_len.max(1);
        Self::new(source_id, zoom, frame_index.div_euclid(buffer_len), buffer_len, fps)
    }

    pub fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits)
    }

    pub fn first_frame(&self) -> i64 {
        self.buffer_index * self.buffer_len
    }

    pub fn contains_frame(&self, frame_index: i64) -> bool {
        frame_index.div_euclid(self.buffer_len) == self.buffer_index
    }
}

/// Result of a non-blocking frame query.
#[derive(Debug, Clone)]
pub enum FrameLookup {
    /// Decode requested or in progress; ask again later.
    Pending,
    Ready(DecodedFrame),
    /// Not cached and not coming (not requested, failed, or past the end).
    Missing,
}

impl FrameLookup {
    pub fn is_ready(&self) -> bool {
        matches!(self, FrameLookup::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, FrameLookup::Pending)
    }

    pub fn frame(&self) -> Option<&DecodedFrame> {
        match self {
            FrameLookup::Ready(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_frame(self) -> Option<DecodedFrame> {
        match self {
            FrameLookup::Ready(f) => Some(f),
            _ => None,
        }
    }
}

/// Buffer state as seen by diagnostics, without side effects.
#[derive(Debug, Clone)]
pub enum BufferProbe {
    /// No buffer for this key
    Absent,
    Loading,
    Failed,
    /// Buffer loaded, frame not part of it
    NoFrame,
    Frame(DecodedFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Loading,
    Loaded,
    Failed,
}

#[derive(Debug)]
struct BufferEntry {
    state: BufferState,
    /// Ordered by frame index, starting at the key's first frame
    frames: Vec<DecodedFrame>,
    last_used: Instant,
    mem: usize,
}

impl BufferEntry {
    fn loading(now: Instant) -> Self {
        Self { state: BufferState::Loading, frames: Vec::new(), last_used: now, mem: 0 }
    }

    fn frame(&self, key: &FrameCacheKey, frame_index: i64) -> Option<&DecodedFrame> {
        let local = frame_index - key.first_frame();
        if local < 0 {
            return None;
        }
        self.frames
            .get(local as usize)
            .filter(|f| f.frame_index() == frame_index)
            .or_else(|| self.frames.iter().find(|f| f.frame_index() == frame_index))
    }

    fn destroy(&self) {
        for f in &self.frames {
            f.destroy();
        }
    }
}

/// Hit/miss counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    decoded: AtomicU64,
    failed: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Buffers decoded successfully
    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.decoded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }
}

pub struct FrameCache {
    buffers: Mutex<HashMap<Uuid, HashMap<FrameCacheKey, BufferEntry>>>,
    lru_order: Mutex<IndexSet<FrameCacheKey>>,
    cache_manager: Arc<CacheManager>,
    workers: Arc<Workers>,
    decoder: Arc<dyn VideoDecoder>,
    bus: EventBus,
    stats: Arc<CacheStats>,
    capacity: usize,
    timeout: Duration,
}

impl std::fmt::Debug for FrameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCache")
            .field("buffers", &self.len())
            .field("capacity", &self.capacity)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl FrameCache {
    pub fn new(
        config: &EngineConfig,
        cache_manager: Arc<CacheManager>,
        workers: Arc<Workers>,
        decoder: Arc<dyn VideoDecoder>,
        bus: EventBus,
    ) -> Arc<Self> {
        let capacity = config.cache_capacity_buffers.max(1);
        debug!(
            "FrameCache created: capacity={} buffers, timeout={} ms",
            capacity, config.buffer_timeout_ms
        );
        Arc::new(Self {
            buffers: Mutex::new(HashMap::new()),
            lru_order: Mutex::new(IndexSet::with_capacity(capacity)),
            cache_manager,
            workers,
            decoder,
            bus,
            stats: Arc::new(CacheStats::default()),
            capacity,
            timeout: Duration::from_millis(config.buffer_timeout_ms),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }

    /// Cache-only query. Never requests a decode.
    pub fn lookup(&self, key: &FrameCacheKey, frame_index: i64) -> FrameLookup {
        let result = {
            let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
            match buffers.get_mut(&key.source_id).and_then(|m| m.get_mut(key)) {
                None => FrameLookup::Missing,
                Some(entry) => {
                    entry.last_used = Instant::now();
                    match entry.state {
                        BufferState::Loading => FrameLookup::Pending,
                        BufferState::Failed => FrameLookup::Missing,
                        BufferState::Loaded => match entry.frame(key, frame_index) {
                            Some(f) if !f.is_destroyed() => FrameLookup::Ready(f.clone()),
                            _ => FrameLookup::Missing,
                        },
                    }
                }
            }
        };

        if result.is_ready() {
            self.stats.record_hit();
            let mut lru = self.lru_order.lock().unwrap_or_else(|e| e.into_inner());
            lru.shift_remove(key);
            lru.insert(*key);
        } else {
            self.stats.record_miss();
        }
        result
    }

    /// Query and, on a miss, queue the buffer for decoding.
    pub fn get_frame(self: &Arc<Self>, source: &MediaSource, key: FrameCacheKey, frame_index: i64) -> FrameLookup {
        match self.lookup(&key, frame_index) {
            FrameLookup::Missing if !self.contains(&key) => {
                self.request_buffer(source, key);
                // the decode may already have finished (or failed)
                match self.lookup(&key, frame_index) {
                    FrameLookup::Missing if !self.contains(&key) => FrameLookup::Pending,
                    other => other,
                }
            }
            other => other,
        }
    }

    pub fn contains(&self, key: &FrameCacheKey) -> bool {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key.source_id)
            .is_some_and(|m| m.contains_key(key))
    }

    /// Diagnostic view of a buffer; touches neither stats nor LRU.
    pub fn probe(&self, key: &FrameCacheKey, frame_index: i64) -> BufferProbe {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        match buffers.get(&key.source_id).and_then(|m| m.get(key)) {
            None => BufferProbe::Absent,
            Some(entry) => match entry.state {
                BufferState::Loading => BufferProbe::Loading,
                BufferState::Failed => BufferProbe::Failed,
                BufferState::Loaded => match entry.frame(key, frame_index) {
                    Some(f) => BufferProbe::Frame(f.clone()),
                    None => BufferProbe::NoFrame,
                },
            },
        }
    }

    /// Queue a decode for `key` unless the buffer is cached or loading.
    ///
    /// Returns true when a new request was queued.
    pub fn request_buffer(self: &Arc<Self>, source: &MediaSource, key: FrameCacheKey) -> bool {
        debug_assert_eq!(source.source_id, key.source_id);
        {
            let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
            let per_source = buffers.entry(key.source_id).or_default();
            if per_source.contains_key(&key) {
                return false;
            }
            per_source.insert(key, BufferEntry::loading(Instant::now()));
            self.lru_order.lock().unwrap_or_else(|e| e.into_inner()).insert(key);
        }
        self.enforce_limits();

        let request = BufferRequest {
            source: source.clone(),
            zoom: key.zoom,
            buffer_index: key.buffer_index,
            buffer_len: key.buffer_len,
            fps: key.fps(),
        };
        let decoder = Arc::clone(&self.decoder);
        let on_done = Arc::downgrade(self);
        let on_cancel = Arc::downgrade(self);
        let epoch = self.cache_manager.current_epoch();

        self.workers.execute_with_epoch(
            epoch,
            move || {
                let result = decoder.decode_buffer(&request);
                if let Some(cache) = on_done.upgrade() {
                    cache.complete(key, result);
                }
            },
            move || {
                if let Some(cache) = on_cancel.upgrade() {
                    cache.drop_loading(&key);
                }
            },
        );
        true
    }

    fn complete(&self, key: FrameCacheKey, result: CutstripResult<Vec<DecodedFrame>>) {
        let ok = result.is_ok();
        let filled = {
            let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
            match buffers.get_mut(&key.source_id).and_then(|m| m.get_mut(&key)) {
                Some(entry) if entry.state == BufferState::Loading => {
                    match result {
                        Ok(mut frames) => {
                            frames.sort_by_key(|f| f.frame_index());
                            let mem = frames.iter().map(|f| f.mem()).sum();
                            entry.frames = frames;
                            entry.mem = mem;
                            entry.state = BufferState::Loaded;
                            self.cache_manager.add_memory(mem);
                            self.stats.decoded.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                "Cached buffer {}:z{}:{} ({} frames, {} KB)",
                                key.source_id,
                                key.zoom,
                                key.buffer_index,
                                entry.frames.len(),
                                mem / 1024
                            );
                        }
                        Err(e) => {
                            entry.state = BufferState::Failed;
                            self.stats.failed.fetch_add(1, Ordering::Relaxed);
                            warn!("Decode failed for {}:z{}:{}: {}", key.source_id, key.zoom, key.buffer_index, e);
                        }
                    }
                    true
                }
                _ => {
                    // invalidated or evicted while decoding
                    if let Ok(frames) = result {
                        for f in &frames {
                            f.destroy();
                        }
                    }
                    false
                }
            }
        };

        if filled {
            self.enforce_limits();
            self.bus.emit(BufferReady { key, ok });
        }
    }

    fn drop_loading(&self, key: &FrameCacheKey) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let mut lru = self.lru_order.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(per_source) = buffers.get_mut(&key.source_id) {
            if per_source.get(key).is_some_and(|e| e.state == BufferState::Loading) {
                per_source.remove(key);
                lru.shift_remove(key);
                if per_source.is_empty() {
                    buffers.remove(&key.source_id);
                }
            }
        }
    }

    fn remove_entry(
        buffers: &mut HashMap<Uuid, HashMap<FrameCacheKey, BufferEntry>>,
        key: &FrameCacheKey,
    ) -> Option<BufferEntry> {
        let per_source = buffers.get_mut(&key.source_id)?;
        let entry = per_source.remove(key);
        if per_source.is_empty() {
            buffers.remove(&key.source_id);
        }
        entry
    }

    /// Evict the least recently used buffer. Returns false when empty.
    fn evict_oldest(&self) -> bool {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let mut lru = self.lru_order.lock().unwrap_or_else(|e| e.into_inner());
        let Some(key) = lru.shift_remove_index(0) else {
            return false;
        };
        if let Some(entry) = Self::remove_entry(&mut buffers, &key) {
            entry.destroy();
            self.cache_manager.free_memory(entry.mem);
            debug!(
                "LRU evicted: {}:z{}:{} (freed {} KB)",
                key.source_id,
                key.zoom,
                key.buffer_index,
                entry.mem / 1024
            );
        }
        true
    }

    fn enforce_limits(&self) {
        while self.cache_manager.check_memory_limit() {
            if !self.evict_oldest() {
                break;
            }
        }
        while self.len() > self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }
    }

    /// Release buffers unused for longer than the timeout. Returns evicted count.
    pub fn maintain(&self) -> usize {
        self.maintain_at(Instant::now())
    }

    pub fn maintain_at(&self, now: Instant) -> usize {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let mut lru = self.lru_order.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<FrameCacheKey> = buffers
            .values()
            .flat_map(|m| m.iter())
            .filter(|(_, e)| now.saturating_duration_since(e.last_used) > self.timeout)
            .map(|(k, _)| *k)
            .collect();

        for key in &expired {
            if let Some(entry) = Self::remove_entry(&mut buffers, key) {
                entry.destroy();
                self.cache_manager.free_memory(entry.mem);
            }
            lru.shift_remove(key);
        }
        if !expired.is_empty() {
            debug!("Timed out {} buffers", expired.len());
        }
        expired.len()
    }

    /// Drop every buffer of a source, e.g. after its file changed.
    pub fn invalidate(&self, source_id: Uuid) {
        let removed = {
            let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
            let mut lru = self.lru_order.lock().unwrap_or_else(|e| e.into_inner());
            let removed = buffers.remove(&source_id);
            if removed.is_some() {
                lru.retain(|k| k.source_id != source_id);
            }
            removed
        };

        if let Some(entries) = removed {
            let mut freed = 0usize;
            for entry in entries.values() {
                entry.destroy();
                freed += entry.mem;
            }
            self.cache_manager.free_memory(freed);
            debug!(
                "Invalidated source {}: {} buffers, {} KB freed",
                source_id,
                entries.len(),
                freed / 1024
            );
        }
        self.bus.emit(SourceInvalidated { source_id });
    }

    pub fn clear_all(&self) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let mut lru = self.lru_order.lock().unwrap_or_else(|e| e.into_inner());
        for entry in buffers.values().flat_map(|m| m.values()) {
            entry.destroy();
            self.cache_manager.free_memory(entry.mem);
        }
        buffers.clear();
        lru.clear();
        debug!("Cleared entire frame cache");
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Number of buffers, loading ones included.
    pub fn len(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|m| m.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    pub fn has_source(&self, source_id: Uuid) -> bool {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&source_id)
    }
}
