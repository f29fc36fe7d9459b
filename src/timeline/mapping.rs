//! Project time <-> pixel mapping of a timeline row.
//!
//! The visible window is centered on `central_time` and spans
//! `2 * dt_half_length` seconds over the pixel range `[x0, x1)`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeMapping {
    pub central_time: f64,
    pub dt_half_length: f64,
    pub x0: i32,
    pub x1: i32,
}

impl TimeMapping {
    pub fn new(central_time: f64, dt_half_length: f64, x0: i32, x1: i32) -> Self {
        Self { central_time, dt_half_length, x0, x1 }
    }

    /// Mapping whose left edge sits at `t0`.
    pub fn from_window(t0: f64, t1: f64, x0: i32, x1: i32) -> Self {
        let half = (t1 - t0) * 0.5;
        Self::new(t0 + half, half, x0, x1)
    }

    pub fn width(&self) -> i32 {
        (self.x1 - self.x0).max(1)
    }

    /// Pixels per second.
    pub fn time_scale(&self) -> f64 {
        self.width() as f64 / (self.dt_half_length * 2.0)
    }

    /// Seconds per pixel column.
    pub fn dt_per_pixel(&self) -> f64 {
        self.dt_half_length * 2.0 / self.width() as f64
    }

    pub fn middle_x(&self) -> f64 {
        (self.x0 + self.x1) as f64 * 0.5
    }

    pub fn time_at(&self, x: f64) -> f64 {
        self.central_time + (x - self.middle_x()) * self.dt_per_pixel()
    }

    pub fn x_at(&self, time: f64) -> f64 {
        (time - self.central_time) * self.time_scale() + self.middle_x()
    }

    pub fn left_time(&self) -> f64 {
        self.time_at(self.x0 as f64)
    }

    pub fn right_time(&self) -> f64 {
        self.time_at(self.x1 as f64)
    }

    /// Same window, panned to another central time.
    pub fn with_central_time(self, central_time: f64) -> Self {
        Self { central_time, ..self }
    }

    pub fn same_pixels(&self, other: &TimeMapping) -> bool {
        self.x0 == other.x0 && self.x1 == other.x1
    }
}
