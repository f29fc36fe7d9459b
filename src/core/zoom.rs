//! Zoom-level policy for decoded frames.
//!
//! `required_zoom` turns the on-screen size of a clip into an integer
//! downscale factor; `cacheable_zoom_level` snaps that factor onto a small set
//! of buckets so panning and zooming keep hitting the same cache entries.

use glam::{Mat4, Vec4};

/// Everything needed to project a clip's quad onto the viewport.
#[derive(Debug, Clone, Copy)]
pub struct ViewProjection {
    /// World -> clip space
    pub matrix: Mat4,
    pub viewport_height: f32,
    /// Output frame size; sets the quad's aspect normalisation.
    pub target_width: f32,
    pub target_height: f32,
    pub near: f32,
    pub far: f32,
    pub reversed_depth: bool,
}

impl ViewProjection {
    /// Clip-space depth back to view distance.
    fn unmap_z(&self, z: f32) -> f32 {
        if self.reversed_depth {
            self.near / z
        } else {
            let (n, f) = (self.near, self.far);
            -(2.0 * f * n) / (z * (f - n) - (f + n))
        }
    }
}

/// Depth range of a projected quad clipped to [-1, 1]; `None` when the quad is
/// entirely outside the near/far planes or behind the camera.
fn clipped_z_range(points: &[Vec4]) -> Option<(f32, f32)> {
    let zs: Vec<f32> = points
        .iter()
        .filter(|p| p.w > 0.0)
        .map(|p| p.z / p.w)
        .collect();
    if zs.is_empty() {
        return None;
    }
    let min = zs.iter().copied().fold(f32::INFINITY, f32::min);
    let max = zs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max < -1.0 || min > 1.0 {
        return None;
    }
    Some((min.max(-1.0), max.min(1.0)))
}

/// Raw downscale factor for a `width`x`height` source drawn through `view`.
///
/// Returns `None` when the clip is not visible at all.
pub fn required_zoom(view: &ViewProjection, width: u32, height: u32) -> Option<i32> {
    if width == 0 || height == 0 {
        return None;
    }
    let (w, h) = (width as f32, height as f32);
    let avg_size = if w * view.target_height > h * view.target_width {
        w * view.target_height / view.target_width
    } else {
        h
    };
    let sx = w / avg_size;
    let sy = h / avg_size;

    let corners = [(-sx, -sy), (-sx, sy), (sx, -sy), (sx, sy)]
        .map(|(x, y)| view.matrix * Vec4::new(x, y, 0.0, 1.0));
    let (z0, z1) = clipped_z_range(&corners)?;

    let closest = view.unmap_z(z0).min(view.unmap_z(z1));
    let pixel_zoom = view.viewport_height / (closest * h);
    let zoom = 1.0 / pixel_zoom;
    if !zoom.is_finite() {
        return Some(1);
    }
    Some((zoom.floor() as i32).max(1))
}

/// Snap a raw zoom factor onto a cacheable bucket.
///
/// Small and common factors pass through; the rest are rounded to the nearest
/// third of a power of two.
pub fn cacheable_zoom_level(level: i32) -> i32 {
    match level {
        i32::MIN..=0 => 1,
        1..=6 | 8 | 12 | 16 => level,
        _ => {
            const STEPS_IN_2: f64 = 3.0;
            let log = (level as f64).log2();
            let rounded = (STEPS_IN_2 * log).round() / STEPS_IN_2;
            2f64.powf(rounded) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn camera_at(distance: f32) -> ViewProjection {
        let proj = Mat4::perspective_rh_gl(60f32.to_radians(), 16.0 / 9.0, 0.1, 1000.0);
        let view = Mat4::from_translation(Vec3::new(0.0, 0.0, -distance));
        ViewProjection {
            matrix: proj * view,
            viewport_height: 1080.0,
            target_width: 1920.0,
            target_height: 1080.0,
            near: 0.1,
            far: 1000.0,
            reversed_depth: false,
        }
    }

    #[test]
    fn test_cacheable_passthrough() {
        for level in [1, 2, 3, 4, 5, 6, 8, 12, 16] {
            assert_eq!(cacheable_zoom_level(level), level);
        }
        assert_eq!(cacheable_zoom_level(0), 1);
        assert_eq!(cacheable_zoom_level(-7), 1);
    }

    #[test]
    fn test_cacheable_rounds_to_third_octaves() {
        assert_eq!(cacheable_zoom_level(7), 6);
        assert_eq!(cacheable_zoom_level(9), 10);
        assert_eq!(cacheable_zoom_level(32), 32);
        assert_eq!(cacheable_zoom_level(33), 32);
    }

    #[test]
    fn test_cacheable_is_idempotent() {
        for raw in -3..=4096 {
            let once = cacheable_zoom_level(raw);
            assert_eq!(cacheable_zoom_level(once), once, "raw = {}", raw);
        }
    }

    #[test]
    fn test_required_zoom_grows_with_distance() {
        let near = required_zoom(&camera_at(2.0), 1920, 1080).expect("visible");
        let far = required_zoom(&camera_at(50.0), 1920, 1080).expect("visible");
        assert!(near >= 1);
        assert!(far > near);
        // distance * h / viewport_h, give or take depth precision
        assert!((49..=50).contains(&far), "far = {}", far);
    }

    #[test]
    fn test_required_zoom_never_below_one() {
        assert_eq!(required_zoom(&camera_at(0.5), 1920, 1080), Some(1));
    }

    #[test]
    fn test_quad_behind_far_plane_is_invisible() {
        assert_eq!(required_zoom(&camera_at(5000.0), 1920, 1080), None);
        assert_eq!(required_zoom(&camera_at(5.0), 0, 1080), None);
    }
}
