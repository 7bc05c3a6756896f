//! Lock-free scalar parameters.
//!
//! [`AudioParam`] stores an `f32` as `AtomicU32` bits. The control thread
//! calls [`set_value`](AudioParam::set_value), the render thread calls
//! [`value`](AudioParam::value) once per quantum. Values are clamped to the
//! parameter's range on write.

use std::sync::atomic::{AtomicU32, Ordering};

/// A named, range-checked parameter shared between threads.
#[derive(Debug)]
pub struct AudioParam {
    name: &'static str,
    value: AtomicU32,
    default: f32,
    min: f32,
    max: f32,
}

impl AudioParam {
    /// Create a parameter. `default` is clamped into `min..=max`.
    ///
    /// Reversed bounds are swapped and a NaN bound leaves that side
    /// unbounded. A NaN default becomes zero clamped into the range.
    pub fn new(name: &'static str, default: f32, min: f32, max: f32) -> Self {
        let min = if min.is_nan() { f32::NEG_INFINITY } else { min };
        let max = if max.is_nan() { f32::INFINITY } else { max };
        let (min, max) = if min > max { (max, min) } else { (min, max) };
        let default = if default.is_nan() { 0.0 } else { default }.clamp(min, max);
        Self {
            name,
            value: AtomicU32::new(default.to_bits()),
            default,
            min,
            max,
        }
    }

    /// Parameter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current value.
    #[inline]
    pub fn value(&self) -> f32 {
        f32::from_bits(self.value.load(Ordering::Acquire))
    }

    /// Set the value, clamped to the range. NaN is ignored.
    pub fn set_value(&self, value: f32) {
        if value.is_nan() {
            return;
        }
        self.value
            .store(value.clamp(self.min, self.max).to_bits(), Ordering::Release);
    }

    /// Value at construction.
    pub fn default_value(&self) -> f32 {
        self.default
    }

    /// Lower bound.
    pub fn min_value(&self) -> f32 {
        self.min
    }

    /// Upper bound.
    pub fn max_value(&self) -> f32 {
        self.max
    }

    /// Restore the default.
    pub fn reset(&self) {
        self.value.store(self.default.to_bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_value_clamps() {
        let p = AudioParam::new("gain", 1.0, 0.0, 4.0);
        p.set_value(10.0);
        assert_eq!(p.value(), 4.0);
        p.set_value(-3.0);
        assert_eq!(p.value(), 0.0);
    }

    #[test]
    fn nan_is_ignored() {
        let p = AudioParam::new("gain", 1.0, 0.0, 4.0);
        p.set_value(f32::NAN);
        assert_eq!(p.value(), 1.0);
    }

    #[test]
    fn reset_restores_default() {
        let p = AudioParam::new("freq", 440.0, 0.0, 20000.0);
        p.set_value(880.0);
        p.reset();
        assert_eq!(p.value(), 440.0);
        assert_eq!(p.default_value(), 440.0);
    }

    #[test]
    fn default_is_clamped() {
        let p = AudioParam::new("q", 50.0, 0.0, 10.0);
        assert_eq!(p.value(), 10.0);
    }

    #[test]
    fn malformed_bounds_are_repaired() {
        let reversed = AudioParam::new("q", 2.0, 10.0, 1.0);
        assert_eq!((reversed.min_value(), reversed.max_value()), (1.0, 10.0));
        assert_eq!(reversed.value(), 2.0);

        let open = AudioParam::new("freq", 5.0, f32::NAN, 4.0);
        assert_eq!(open.min_value(), f32::NEG_INFINITY);
        assert_eq!(open.value(), 4.0);
        open.set_value(-1e9);
        assert_eq!(open.value(), -1e9);

        let nan_default = AudioParam::new("detune", f32::NAN, 1.0, f32::NAN);
        assert_eq!(nan_default.max_value(), f32::INFINITY);
        assert_eq!(nan_default.default_value(), 1.0);
    }
}
