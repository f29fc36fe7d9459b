//! One [`StreamManager`] per media source, created on first use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::decoder::VideoDecoder;
use crate::core::frame_cache::FrameCache;
use crate::core::stream_manager::{StreamContext, StreamManager};
use crate::core::zoom::cacheable_zoom_level;
use crate::entities::MediaSource;
use crate::timeline::solution::StripeSolution;

/// Decode zoom for a thumbnail `width` pixels wide.
pub fn thumbnail_zoom(source: &MediaSource, width: u32) -> i32 {
    let raw = (source.meta.width / width.max(1)) as i32;
    cacheable_zoom_level(raw.max(1)).max(1)
}

/// Thumbnail width for a row `row_height` pixels tall.
pub fn thumbnail_width(source: &MediaSource, row_height: u32) -> u32 {
    let meta = &source.meta;
    (row_height as u64 * meta.width as u64 / meta.height.max(1) as u64).max(1) as u32
}

pub struct StreamRegistry {
    managers: Mutex<HashMap<Uuid, StreamManager>>,
    cache: Arc<FrameCache>,
    decoder: Arc<dyn VideoDecoder>,
    config: EngineConfig,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry").field("sources", &self.len()).finish_non_exhaustive()
    }
}

impl StreamRegistry {
    pub fn new(cache: Arc<FrameCache>, decoder: Arc<dyn VideoDecoder>, config: &EngineConfig) -> Self {
        Self { managers: Mutex::new(HashMap::new()), cache, decoder, config: config.clone() }
    }

    /// Run `f` on the manager of `source`, creating it if needed.
    ///
    /// Streams the call replaced are joined after the registry lock is released.
    pub fn with_manager<R>(&self, source: &MediaSource, f: impl FnOnce(&mut StreamManager) -> R) -> R {
        let (result, retired) = {
            let mut managers = self.managers.lock().unwrap_or_else(|e| e.into_inner());
            let manager = managers.entry(source.source_id).or_insert_with(|| {
                debug!("Stream manager created for {}", source.path);
                StreamManager::new(source.clone(), Arc::clone(&self.cache), Arc::clone(&self.decoder), &self.config)
            });
            if manager.source() != source {
                manager.set_source(source.clone());
            }
            let result = f(manager);
            (result, manager.take_retired())
        };
        for mut stream in retired {
            stream.destroy();
        }
        result
    }

    /// Run `f` on the manager of `source_id` if one exists.
    pub fn with_existing<R>(&self, source_id: Uuid, f: impl FnOnce(Option<&StreamManager>) -> R) -> R {
        let managers = self.managers.lock().unwrap_or_else(|e| e.into_inner());
        f(managers.get(&source_id))
    }

    /// Queue decode buffers for every thumbnail range a solve saw.
    pub fn claim(&self, solution: &StripeSolution, row_height: u32) {
        // thumbnails are random access, never streamed
        let ctx = StreamContext { scrubbing: true, ..StreamContext::interactive(1.0) };
        for claim in &solution.claims {
            let Some(source) = solution.node(claim.node).and_then(|n| n.content.media()) else {
                continue;
            };
            let zoom = thumbnail_zoom(source, thumbnail_width(source, row_height));
            self.with_manager(source, |m| m.claim(&ctx, claim.min_t, claim.max_t, zoom));
        }
    }

    /// Drop the manager of a source, stopping its stream.
    pub fn remove(&self, source_id: Uuid) -> bool {
        let removed = self.managers.lock().unwrap_or_else(|e| e.into_inner()).remove(&source_id);
        // lock released: dropping joins the stream thread
        match removed {
            Some(manager) => {
                drop(manager);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.managers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache_man::CacheManager;
    use crate::core::decoder::{FrameSequence, SyntheticDecoder};
    use crate::core::event_bus::EventBus;
    use crate::core::frame_cache::FrameCacheKey;
    use crate::core::workers::Workers;
    use crate::entities::{NodeContent, Scene, SceneNode, SourceMeta};
    use crate::timeline::mapping::TimeMapping;
    use crate::entities::DecodedFrame;
    use crate::error::CutstripResult;
    use crate::timeline::solver::TrackSolver;
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::thread;
    use std::time::Duration;

    /// Stream decoder whose frames wait until the gate sender is dropped.
    struct GatedDecoder {
        gate: Receiver<()>,
    }

    struct GatedSequence {
        gate: Receiver<()>,
    }

    impl FrameSequence for GatedSequence {
        fn next_frame(&mut self) -> CutstripResult<Option<DecodedFrame>> {
            let _ = self.gate.recv();
            Ok(None)
        }
    }

    impl VideoDecoder for GatedDecoder {
        fn decode_buffer(&self, request: &crate::core::decoder::BufferRequest) -> CutstripResult<Vec<DecodedFrame>> {
            SyntheticDecoder::new().decode_buffer(request)
        }

        fn open_stream(
            &self,
            _source: &MediaSource,
            _max_size: u32,
            _fps: f64,
            _start_frame: i64,
        ) -> CutstripResult<Box<dyn FrameSequence>> {
            Ok(Box::new(GatedSequence { gate: self.gate.clone() }))
        }
    }

    fn registry() -> (StreamRegistry, Arc<FrameCache>) {
        registry_with(Arc::new(SyntheticDecoder::new()))
    }

    fn registry_with(decoder: Arc<dyn VideoDecoder>) -> (StreamRegistry, Arc<FrameCache>) {
        let manager = Arc::new(CacheManager::with_limit(usize::MAX / 2));
        let workers = Arc::new(Workers::inline(manager.epoch_ref()));
        let config = EngineConfig::default();
        let cache = FrameCache::new(&config, manager, workers, Arc::clone(&decoder), EventBus::new());
        (StreamRegistry::new(Arc::clone(&cache), decoder, &config), cache)
    }

    #[test]
    fn test_thumbnail_zoom_buckets() {
        let src = MediaSource::new("v.mp4", SourceMeta::video(1920, 1080, 30.0, 300));
        assert_eq!(thumbnail_width(&src, 45), 80);
        assert_eq!(thumbnail_zoom(&src, 80), 25);
        assert_eq!(thumbnail_zoom(&src, 4000), 1);
    }

    #[test]
    fn test_managers_are_reused_per_source() {
        let (registry, _) = registry();
        let src = MediaSource::new("v.mp4", SourceMeta::video(64, 36, 30.0, 300));
        registry.with_manager(&src, |_| ());
        registry.with_manager(&src, |_| ());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(src.source_id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_claim_requests_thumbnail_buffers() {
        let (registry, cache) = registry();
        let src = MediaSource::new("v.mp4", SourceMeta::video(160, 90, 10.0, 100));
        let mut scene = Scene::new();
        scene
            .attach(scene.root(), SceneNode::new("v").with_track(0).with_content(NodeContent::Video(src.clone())))
            .expect("attach");
        let solution =
            TrackSolver::default().solve(Arc::new(scene.retained_for_track(0)), TimeMapping::from_window(0.0, 10.0, 0, 100));
        registry.claim(&solution, 45);

        let zoom = thumbnail_zoom(&src, thumbnail_width(&src, 45));
        let key = FrameCacheKey::for_frame(src.source_id, zoom, 0, 128, 10.0);
        assert!(cache.contains(&key));
    }

    #[test]
    fn test_replaced_stream_joined_outside_lock() {
        let (gate_tx, gate_rx): (Sender<()>, Receiver<()>) = bounded(0);
        let (registry, _) = registry_with(Arc::new(GatedDecoder { gate: gate_rx }));
        let registry = Arc::new(registry);
        let src = MediaSource::new("long.mp4", SourceMeta::video(64, 36, 30.0, 1000));
        let ctx = StreamContext::interactive(1.0);
        registry
            .with_manager(&src, |m| m.stream_frame(&ctx, 1, 0, 30.0))
            .expect("first stream");

        // the z1 thread is stuck decoding, so replacing it waits on the join
        let replacer = {
            let (registry, src, ctx) = (Arc::clone(&registry), src.clone(), ctx.clone());
            thread::spawn(move || registry.with_manager(&src, |m| m.stream_frame(&ctx, 2, 0, 30.0).map(|_| ())))
        };
        thread::sleep(Duration::from_millis(50));

        let (done_tx, done_rx) = bounded(1);
        let reader = Arc::clone(&registry);
        thread::spawn(move || {
            let _ = done_tx.send(reader.len());
        });
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)), Ok(1));

        drop(gate_tx);
        assert!(replacer.join().expect("replacer").is_ok());
    }
}
