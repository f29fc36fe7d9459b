//! Error taxonomy for the timeline engine.
//!
//! Transient unavailability (cache miss, buffer still decoding) is NOT an
//! error here - it is modelled as [`FrameLookup::Pending`](crate::core::FrameLookup).
//! Only structural problems surface as `CutstripError`.

use uuid::Uuid;

use crate::entities::NodeId;

/// Convenience result type used across the crate.
pub type CutstripResult<T> = Result<T, CutstripError>;

#[derive(thiserror::Error, Debug)]
pub enum CutstripError {
    /// Attaching the node would make it its own ancestor.
    #[error("attaching {child} under {parent} would create a cycle")]
    CyclicParent { parent: NodeId, child: NodeId },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("the scene root cannot be removed or reparented")]
    RootImmutable,

    /// Fade durations must be finite and non-negative.
    #[error("invalid fade on node {node}: {reason}")]
    InvalidFade { node: NodeId, reason: String },

    /// Start/end/offset/dilation that cannot be evaluated (NaN, start > end).
    #[error("invalid time setup on node {node}: {reason}")]
    InvalidTime { node: NodeId, reason: String },

    /// A frame was structurally unavailable during a final render.
    #[error("missing frame {frame_index} of {path} (source {source_id})")]
    MissingFrame { source_id: Uuid, path: String, frame_index: i64 },

    /// A stream manager was used for final output and then for preview (or vice versa).
    #[error("render mode changed from final={was_final} within one stream lifetime")]
    ModeChanged { was_final: bool },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CutstripError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for the fatal final-render condition.
    pub fn is_missing_frame(&self) -> bool {
        matches!(self, Self::MissingFrame { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_frame_message_names_file_and_index() {
        let source_id = Uuid::new_v4();
        let err = CutstripError::MissingFrame { source_id, path: "shots/a.mp4".into(), frame_index: 42 };
        let msg = err.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("shots/a.mp4"));
        assert!(msg.contains(&source_id.to_string()));
        assert!(err.is_missing_frame());
    }

    #[test]
    fn test_anyhow_wraps_transparently() {
        let err: CutstripError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.to_string(), "disk on fire");
        assert!(!err.is_missing_frame());
    }
}
