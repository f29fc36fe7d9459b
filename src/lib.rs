//! cutstrip - timeline stripes and multi-resolution frame caching for
//! nonlinear editors.
//!
//! The scene hierarchy lives in [`entities`], caches, decode workers and
//! streams in [`core`], and the per-row solver plus its draw path in
//! [`timeline`]. Most callers only need [`Timeline`].

// Engine (cache, workers, streams)
pub mod core;

// Data model and settings
pub mod config;
pub mod entities;
pub mod error;

// Rows: solve, draw, hit test
pub mod timeline;

pub use config::{init_logging, EngineConfig, PathConfig};
pub use core::frame_cache::{FrameCache, FrameCacheKey, FrameLookup};
pub use core::stream_manager::StreamContext;
pub use entities::{AnimatedValue, MediaSource, NodeContent, NodeId, Scene, SceneNode, SourceMeta};
pub use error::{CutstripError, CutstripResult};
pub use timeline::{DrawContext, Painter, StripeSolution, TimeMapping, Timeline};
