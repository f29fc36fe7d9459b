//! Gradient segment: a run of pixel columns drawn as one linear gradient.
//!
//! A segment grows one column at a time while the new sample stays within
//! `sqrt(min_dist_sq)` of the line through its start color and the end color
//! recorded when it was two columns wide. That reference is frozen: deriving
//! it from the moving end point would let the error creep up with every
//! extension. The stored end color is the reference line's value at the end,
//! so the drawn gradient is the line every accepted sample was tested against.

use std::fmt;

use glam::Vec4;

use crate::entities::color::{argb_alpha, dist_sq, from_argb, mix_argb, to_argb};
use crate::entities::NodeId;

#[derive(Debug, Clone, PartialEq)]
pub struct GradientSegment {
    pub owner: NodeId,
    pub x0: i32,
    /// Inclusive
    pub x1: i32,
    /// ARGB
    pub c0: u32,
    pub c1: u32,
    first_c1: u32,
    first_x1: i32,
    /// Width in pixels, `x1 - x0 + 1`
    pub w: i32,
}

impl GradientSegment {
    pub fn new(owner: NodeId, x0: i32, x1: i32, color: Vec4) -> Self {
        let c = to_argb(color);
        Self { owner, x0, x1, c0: c, c1: c, first_c1: c, first_x1: x1, w: x1 - x0 + 1 }
    }

    pub fn first_x1(&self) -> i32 {
        self.first_x1
    }

    pub fn first_c1(&self) -> u32 {
        self.first_c1
    }

    /// Color of the frozen reference line at column `x`.
    fn predicted(&self, x: i32) -> Vec4 {
        let span = (self.first_x1 - self.x0).max(1) as f32;
        let f = (x - self.x0) as f32 / span;
        from_argb(self.c0).lerp(from_argb(self.first_c1), f)
    }

    /// Whether `color` at column `x` continues this segment within tolerance.
    pub fn is_linear(&self, x: i32, step: i32, color: Vec4, min_dist_sq: f32) -> bool {
        // one step wide: nothing to compare against yet
        if self.x1 < self.x0 + step {
            return true;
        }
        dist_sq(color, self.predicted(x)) < min_dist_sq
    }

    pub fn set_end(&mut self, x: i32, step: i32, color: Vec4) {
        self.x1 = x;
        self.w = x - self.x0 + 1;
        if self.w < step || self.first_x1 == self.x0 {
            self.first_c1 = to_argb(color);
            self.first_x1 = x;
            self.c1 = self.first_c1;
        } else {
            self.c1 = to_argb(self.predicted(x));
        }
    }

    /// False when both ends are below the visibility threshold.
    pub fn needs_drawn(&self, min_alpha: f32) -> bool {
        argb_alpha(self.c0).max(argb_alpha(self.c1)) as f32 / 255.0 >= min_alpha
    }

    /// Reconstructed ARGB color at column `x`.
    pub fn color_at(&self, x: i32) -> u32 {
        if self.x1 <= self.x0 {
            return self.c0;
        }
        mix_argb(self.c0, self.c1, (x - self.x0) as f32 / (self.x1 - self.x0) as f32)
    }

    pub fn contains(&self, x: i32) -> bool {
        (self.x0..=self.x1).contains(&x)
    }
}

impl fmt::Display for GradientSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.c0 == self.c1 {
            write!(f, "[{}-{}, #{:08x}]", self.x0, self.x1, self.c0)
        } else {
            write!(f, "[{}-{}, #{:08x} -> #{:08x}]", self.x0, self.x1, self.c0, self.c1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const TOL: f32 = (3.0 / 255.0) * (3.0 / 255.0);

    #[test]
    fn test_constant_color_always_extends() {
        let mut g = GradientSegment::new(Uuid::nil(), 0, 0, Vec4::ONE);
        for x in 1..50 {
            assert!(g.is_linear(x, 1, Vec4::ONE, TOL));
            g.set_end(x, 1, Vec4::ONE);
        }
        assert_eq!((g.x0, g.x1, g.w), (0, 49, 50));
        assert_eq!(g.c0, g.c1);
        assert_eq!(g.to_string(), "[0-49, #ffffffff]");
    }

    #[test]
    fn test_reference_is_frozen_after_second_column() {
        let mut g = GradientSegment::new(Uuid::nil(), 10, 10, Vec4::new(0.0, 0.0, 0.0, 1.0));
        g.set_end(11, 1, Vec4::new(0.1, 0.0, 0.0, 1.0));
        assert_eq!(g.first_x1(), 11);
        let reference = g.first_c1();
        // on the line through (10, 0.0) and (11, 0.1)
        assert!(g.is_linear(12, 1, Vec4::new(0.2, 0.0, 0.0, 1.0), TOL));
        g.set_end(12, 1, Vec4::new(0.2, 0.0, 0.0, 1.0));
        assert_eq!(g.first_c1(), reference);
        assert_eq!(g.first_x1(), 11);
        // flat where a ramp was predicted
        assert!(!g.is_linear(13, 1, Vec4::new(0.2, 0.0, 0.0, 1.0), TOL));
    }

    #[test]
    fn test_needs_drawn_threshold() {
        let g = GradientSegment::new(Uuid::nil(), 0, 0, Vec4::new(1.0, 1.0, 1.0, 0.0));
        assert!(!g.needs_drawn(0.5 / 255.0));
        let g = GradientSegment::new(Uuid::nil(), 0, 0, Vec4::new(1.0, 1.0, 1.0, 1.0 / 255.0));
        assert!(g.needs_drawn(0.5 / 255.0));
    }

    #[test]
    fn test_color_at_interpolates() {
        let mut g = GradientSegment::new(Uuid::nil(), 0, 0, Vec4::new(0.0, 0.0, 0.0, 1.0));
        g.set_end(1, 1, Vec4::new(0.01, 0.0, 0.0, 1.0));
        for x in 2..=10 {
            g.set_end(x, 1, Vec4::new(0.01 * x as f32, 0.0, 0.0, 1.0));
        }
        assert_eq!(g.color_at(0), g.c0);
        assert_eq!(g.color_at(10), g.c1);
        let mid = from_argb(g.color_at(5));
        let end = from_argb(g.c1);
        assert!((mid.x - end.x * 0.5).abs() <= 1.0 / 255.0);
    }
}
