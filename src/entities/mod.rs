//! Entities module - the data model the timeline evaluates.
//!
//! - `keyframes`: animated, time-indexed properties
//! - `node`: scene node time/color model, media content
//! - `scene`: node arena, hierarchy, track snapshots
//! - `frame`: decoded frame handles shared with the cache

pub mod color;
pub mod frame;
pub mod keyframes;
pub mod node;
pub mod scene;

pub use frame::{DecodedFrame, FrameStatus};
pub use keyframes::{AnimatedValue, Interpolate, Keyframe};
pub use node::{LoopMode, MediaSource, NodeContent, NodeSample, SceneNode, SourceMeta};
pub use scene::{RetainedTree, Scene};

/// Stable identity of a scene node.
pub type NodeId = uuid::Uuid;
