//! Core engine modules - caches, decode workers, streams, zoom policy.
//!
//! Nothing in here draws; the timeline module consumes these through
//! non-blocking queries only.

pub mod cache_man;
pub mod decoder;
pub mod event_bus;
pub mod frame_cache;
pub mod readiness;
pub mod stream;
pub mod stream_manager;
pub mod workers;
pub mod zoom;

pub use cache_man::CacheManager;
pub use decoder::{
    AudioEnvelopeProvider, BufferRequest, FrameSequence, SyntheticAudio, SyntheticDecoder, VideoDecoder,
};
pub use event_bus::{BufferReady, EventBus, SolutionInstalled, SourceInvalidated};
pub use frame_cache::{BufferProbe, CacheStats, FrameCache, FrameCacheKey, FrameLookup};
pub use readiness::{frame_readiness, readiness_strip, FrameReadiness, ReadinessSources, StatusRun};
pub use stream::{StreamOptions, VideoStream};
pub use stream_manager::{StreamContext, StreamManager};
pub use workers::Workers;
pub use zoom::{cacheable_zoom_level, required_zoom, ViewProjection};
