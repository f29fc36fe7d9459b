//! Draw primitives supplied by the GUI toolkit.
//!
//! Coordinates are window pixels, colors packed ARGB. [`RecordingPainter`]
//! collects commands instead of drawing; headless callers and tests use it.

use crate::entities::DecodedFrame;

pub trait Painter {
    fn rect(&mut self, x: i32, y: i32, w: i32, h: i32, color: u32);

    /// Horizontal gradient from `c0` (left) to `c1` (right).
    fn gradient(&mut self, x: i32, y: i32, w: i32, h: i32, c0: u32, c1: u32);

    /// Gradient-tinted frame; `u0..u1` is the horizontal texture range.
    #[allow(clippy::too_many_arguments)]
    fn textured_gradient(
        &mut self,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
        c0: u32,
        c1: u32,
        frame: &DecodedFrame,
        u0: f32,
        u1: f32,
    );

    /// Diagonal stripes every `stride` pixels, shifted by `offset`.
    #[allow(clippy::too_many_arguments)]
    fn striped(&mut self, x: i32, y: i32, w: i32, h: i32, offset: i32, stride: i32, color: u32);
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    Rect { x: i32, y: i32, w: i32, h: i32, color: u32 },
    Gradient { x: i32, y: i32, w: i32, h: i32, c0: u32, c1: u32 },
    Frame { x: i32, y: i32, w: i32, h: i32, c0: u32, c1: u32, frame_index: i64, u0: f32, u1: f32 },
    Striped { x: i32, y: i32, w: i32, h: i32, offset: i32, stride: i32, color: u32 },
}

impl DrawCommand {
    /// Horizontal extent `[x, x + w)`.
    pub fn span(&self) -> (i32, i32) {
        match *self {
            DrawCommand::Rect { x, w, .. }
            | DrawCommand::Gradient { x, w, .. }
            | DrawCommand::Frame { x, w, .. }
            | DrawCommand::Striped { x, w, .. } => (x, x + w),
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingPainter {
    pub commands: Vec<DrawCommand>,
}

impl RecordingPainter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> impl Iterator<Item = &DrawCommand> {
        self.commands.iter().filter(|c| matches!(c, DrawCommand::Frame { .. }))
    }

    pub fn gradients(&self) -> impl Iterator<Item = &DrawCommand> {
        self.commands.iter().filter(|c| matches!(c, DrawCommand::Gradient { .. }))
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

impl Painter for RecordingPainter {
    fn rect(&mut self, x: i32, y: i32, w: i32, h: i32, color: u32) {
        self.commands.push(DrawCommand::Rect { x, y, w, h, color });
    }

    fn gradient(&mut self, x: i32, y: i32, w: i32, h: i32, c0: u32, c1: u32) {
        self.commands.push(DrawCommand::Gradient { x, y, w, h, c0, c1 });
    }

    fn textured_gradient(
        &mut self,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
        c0: u32,
        c1: u32,
        frame: &DecodedFrame,
        u0: f32,
        u1: f32,
    ) {
        let frame_index = frame.frame_index();
        self.commands.push(DrawCommand::Frame { x, y, w, h, c0, c1, frame_index, u0, u1 });
    }

    fn striped(&mut self, x: i32, y: i32, w: i32, h: i32, offset: i32, stride: i32, color: u32) {
        self.commands.push(DrawCommand::Striped { x, y, w, h, offset, stride, color });
    }
}
