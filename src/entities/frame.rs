//! Decoded video frame handle.
//!
//! A `DecodedFrame` is a cheap-to-clone handle (Arc inside), shared between
//! the decode workers that fill it, the frame cache that owns it and the draw
//! path that reads it. Pixel data lives on the GPU side of the collaborator;
//! here we only track dimensions and lifecycle flags.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Decoder produced the frame, texture not uploaded yet
    Decoded,
    /// Texture resident on the GPU, drawable
    Uploaded,
    /// Texture released (buffer evicted or source invalidated)
    Destroyed,
}

impl FrameStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Decoded,
            1 => Self::Uploaded,
            _ => Self::Destroyed,
        }
    }
}

#[derive(Debug)]
struct FrameData {
    width: u32,
    height: u32,
    frame_index: i64,
    buffer_index: i64,
    blank: bool,
    status: AtomicU8,
}

/// Single decoded frame with atomic status flags.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    data: Arc<FrameData>,
}

impl DecodedFrame {
    /// New frame in `Decoded` state.
    pub fn new(width: u32, height: u32, frame_index: i64, frames_per_buffer: i64) -> Self {
        let buffer_index = frame_index.div_euclid(frames_per_buffer.max(1));
        Self {
            data: Arc::new(FrameData {
                width,
                height,
                frame_index,
                buffer_index,
                blank: false,
                status: AtomicU8::new(0),
            }),
        }
    }

    /// Same as `new` but flagged as visually blank (black/empty frame).
    pub fn blank(width: u32, height: u32, frame_index: i64, frames_per_buffer: i64) -> Self {
        let mut f = Self::new(width, height, frame_index, frames_per_buffer);
        if let Some(data) = Arc::get_mut(&mut f.data) {
            data.blank = true;
        }
        f
    }

    pub fn width(&self) -> u32 {
        self.data.width
    }

    pub fn height(&self) -> u32 {
        self.data.height
    }

    pub fn frame_index(&self) -> i64 {
        self.data.frame_index
    }

    pub fn buffer_index(&self) -> i64 {
        self.data.buffer_index
    }

    pub fn is_blank(&self) -> bool {
        self.data.blank
    }

    pub fn status(&self) -> FrameStatus {
        FrameStatus::from_u8(self.data.status.load(Ordering::Acquire))
    }

    /// Decoded and not yet released.
    pub fn is_created(&self) -> bool {
        !self.is_destroyed()
    }

    pub fn is_on_gpu(&self) -> bool {
        self.status() == FrameStatus::Uploaded
    }

    pub fn is_destroyed(&self) -> bool {
        self.status() == FrameStatus::Destroyed
    }

    /// Drawable right now.
    pub fn is_ready(&self) -> bool {
        self.is_created() && self.is_on_gpu()
    }

    /// Mark the texture as resident. No-op once destroyed.
    pub fn mark_uploaded(&self) {
        let _ = self
            .data
            .status
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn destroy(&self) {
        self.data.status.store(2, Ordering::Release);
    }

    /// Approximate footprint in bytes (RGBA8).
    pub fn mem(&self) -> usize {
        self.data.width as usize * self.data.height as usize * 4
    }

    /// Same underlying frame.
    pub fn ptr_eq(&self, other: &DecodedFrame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_lifecycle() {
        let f = DecodedFrame::new(64, 32, 130, 128);
        assert_eq!(f.buffer_index(), 1);
        assert_eq!(f.status(), FrameStatus::Decoded);
        assert!(!f.is_ready());

        f.mark_uploaded();
        assert!(f.is_ready());

        f.destroy();
        assert!(f.is_destroyed());
        // cannot resurrect
        f.mark_uploaded();
        assert!(f.is_destroyed());
    }

    #[test]
    fn test_clone_shares_state() {
        let f = DecodedFrame::blank(8, 8, 0, 128);
        let g = f.clone();
        f.mark_uploaded();
        assert!(g.is_on_gpu());
        assert!(g.is_blank());
        assert!(f.ptr_eq(&g));
        assert_eq!(f.mem(), 256);
    }
}
