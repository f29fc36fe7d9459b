//! RGBA helpers. Colors are `glam::Vec4` (r, g, b, a) in [0, 1]; the draw
//! layer receives packed ARGB `u32`.

use glam::Vec4;

pub const WHITE: Vec4 = Vec4::ONE;
pub const TRANSPARENT: Vec4 = Vec4::ZERO;

/// Pack normalized RGBA into 0xAARRGGBB.
pub fn to_argb(c: Vec4) -> u32 {
    let ch = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u32;
    (ch(c.w) << 24) | (ch(c.x) << 16) | (ch(c.y) << 8) | ch(c.z)
}

pub fn from_argb(argb: u32) -> Vec4 {
    let ch = |shift: u32| ((argb >> shift) & 0xff) as f32 / 255.0;
    Vec4::new(ch(16), ch(8), ch(0), ch(24))
}

pub fn argb_alpha(argb: u32) -> u32 {
    argb >> 24
}

/// Replace the alpha byte.
pub fn with_alpha(argb: u32, alpha: u32) -> u32 {
    (argb & 0x00ff_ffff) | (alpha.min(255) << 24)
}

/// Channel-wise blend of two packed colors, `f` in [0, 1].
pub fn mix_argb(a: u32, b: u32, f: f32) -> u32 {
    to_argb(from_argb(a).lerp(from_argb(b), f.clamp(0.0, 1.0)))
}

/// Squared Euclidean distance in normalized RGBA space.
pub fn dist_sq(a: Vec4, b: Vec4) -> f32 {
    (a - b).length_squared()
}
