//! Keyframed, time-indexed properties.
//!
//! `AnimatedValue<T>` keeps its keyframes sorted by time. Numeric types are
//! interpolated linearly between the keys around `t`; non-numeric types
//! (strings, flags) hold their value until the next key.
//!
//! Keys with equal time are allowed. A point query exactly at that time
//! returns the LAST of them (stable insertion order).

use glam::{Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};

/// Blend between two values, `t` in [0, 1].
pub trait Interpolate: Clone {
    fn interpolate(a: &Self, b: &Self, t: f64) -> Self;
}

impl Interpolate for f64 {
    fn interpolate(a: &Self, b: &Self, t: f64) -> Self {
        a + (b - a) * t
    }
}

impl Interpolate for f32 {
    fn interpolate(a: &Self, b: &Self, t: f64) -> Self {
        (*a as f64 + (*b as f64 - *a as f64) * t) as f32
    }
}

impl Interpolate for i32 {
    fn interpolate(a: &Self, b: &Self, t: f64) -> Self {
        (*a as f64 + (*b as f64 - *a as f64) * t).round() as i32
    }
}

impl Interpolate for Vec2 {
    fn interpolate(a: &Self, b: &Self, t: f64) -> Self {
        a.lerp(*b, t as f32)
    }
}

impl Interpolate for Vec3 {
    fn interpolate(a: &Self, b: &Self, t: f64) -> Self {
        a.lerp(*b, t as f32)
    }
}

impl Interpolate for Vec4 {
    fn interpolate(a: &Self, b: &Self, t: f64) -> Self {
        a.lerp(*b, t as f32)
    }
}

// Step types: hold until the next key.
impl Interpolate for String {
    fn interpolate(a: &Self, _b: &Self, _t: f64) -> Self {
        a.clone()
    }
}

impl Interpolate for bool {
    fn interpolate(a: &Self, _b: &Self, _t: f64) -> Self {
        *a
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyframe<T> {
    pub time: f64,
    pub value: T,
}

impl<T> Keyframe<T> {
    pub fn new(time: f64, value: T) -> Self {
        Self { time, value }
    }
}

#[derive(Deserialize)]
struct RawAnimatedValue<T> {
    default: T,
    #[serde(default = "Vec::new")]
    keys: Vec<Keyframe<T>>,
}

impl<T> From<RawAnimatedValue<T>> for AnimatedValue<T> {
    fn from(raw: RawAnimatedValue<T>) -> Self {
        let mut keys = raw.keys;
        keys.retain(|k| !k.time.is_nan());
        keys.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self { default: raw.default, keys }
    }
}

/// Ordered keyframe track with a fallback value for the empty case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawAnimatedValue<T>")]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct AnimatedValue<T> {
    default: T,
    keys: Vec<Keyframe<T>>,
}

impl<T: Interpolate> AnimatedValue<T> {
    /// Empty track that always evaluates to `default`.
    pub fn new(default: T) -> Self {
        Self { default, keys: Vec::new() }
    }

    /// Single key at t=0.
    pub fn constant(value: T) -> Self {
        Self {
            default: value.clone(),
            keys: vec![Keyframe::new(0.0, value)],
        }
    }

    pub fn from_keys(default: T, keys: impl IntoIterator<Item = (f64, T)>) -> Self {
        let mut out = Self::new(default);
        for (time, value) in keys {
            out.add_keyframe(time, value);
        }
        out
    }

    pub fn keys(&self) -> &[Keyframe<T>] {
        &self.keys
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    /// Two or more keys: the value can change over time.
    pub fn is_animated(&self) -> bool {
        self.keys.len() >= 2
    }

    /// Replace every key with a single constant.
    pub fn set(&mut self, value: T) {
        self.keys.clear();
        self.keys.push(Keyframe::new(0.0, value));
    }

    /// Insert a key after any keys with the same time. NaN times are ignored.
    pub fn add_keyframe(&mut self, time: f64, value: T) {
        if time.is_nan() {
            return;
        }
        let idx = self.keys.partition_point(|k| k.time <= time);
        self.keys.insert(idx, Keyframe::new(time, value));
    }

    /// Overwrite a key within `equality_dt` of `time`, or insert a new one.
    pub fn set_keyframe(&mut self, time: f64, value: T, equality_dt: f64) {
        if let Some(existing) = self
            .keys
            .iter_mut()
            .find(|k| (k.time - time).abs() < equality_dt)
        {
            existing.value = value;
            return;
        }
        self.add_keyframe(time, value);
    }

    pub fn remove_keyframe(&mut self, index: usize) -> Option<Keyframe<T>> {
        (index < self.keys.len()).then(|| self.keys.remove(index))
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    /// Point query: value at `time`.
    pub fn value_at(&self, time: f64) -> T {
        match self.keys.len() {
            0 => self.default.clone(),
            1 => self.keys[0].value.clone(),
            len => {
                // first key strictly after `time`
                let idx = self.keys.partition_point(|k| k.time <= time);
                if idx == 0 {
                    return self.keys[0].value.clone();
                }
                if idx == len {
                    return self.keys[len - 1].value.clone();
                }
                let k0 = &self.keys[idx - 1];
                let k1 = &self.keys[idx];
                let span = k1.time - k0.time;
                if span <= 0.0 {
                    return k0.value.clone();
                }
                let f = ((time - k0.time) / span).clamp(0.0, 1.0);
                T::interpolate(&k0.value, &k1.value, f)
            }
        }
    }

    /// Range query: keys with `t0 <= time <= t1`, in order.
    ///
    /// Intended for visual cues (keyframe markers), not evaluation.
    pub fn range(&self, t0: f64, t1: f64) -> &[Keyframe<T>] {
        if !(t0 <= t1) {
            return &[];
        }
        let i0 = self.keys.partition_point(|k| k.time < t0);
        let i1 = self.keys.partition_point(|k| k.time <= t1);
        &self.keys[i0..i1.max(i0)]
    }

    /// Time of the first key after `time`, or +inf.
    pub fn next_keyframe_after(&self, time: f64) -> f64 {
        let idx = self.keys.partition_point(|k| k.time <= time);
        self.keys.get(idx).map(|k| k.time).unwrap_or(f64::INFINITY)
    }
}

impl<T: Interpolate + Default> Default for AnimatedValue<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Interpolate> From<T> for AnimatedValue<T> {
    fn from(value: T) -> Self {
        Self::constant(value)
    }
}
