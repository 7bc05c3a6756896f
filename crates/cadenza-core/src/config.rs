//! Context configuration.
//!
//! A [`ContextConfig`] fixes the sample rate, render-quantum size and device
//! channel layout for the lifetime of an [`AudioContext`](crate::AudioContext).
//! With the `serde` feature it can be loaded from TOML; missing keys fall
//! back to the defaults.

use std::time::Duration;

use crate::error::ConfigError;

/// Largest accepted render quantum.
pub const MAX_QUANTUM_FRAMES: usize = 16384;

/// Largest accepted device channel count.
pub const MAX_CHANNELS: usize = 32;

/// Default render quantum, matching the Web Audio block size.
pub const DEFAULT_QUANTUM_FRAMES: usize = 128;

/// Engine configuration for one context.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ContextConfig {
    /// Sample rate in Hz.
    pub sample_rate: f32,
    /// Frames per render quantum. Every bus in the graph has this length.
    pub quantum_frames: usize,
    /// Channels of the device output bus handed to `render`.
    pub output_channels: usize,
    /// Channels of the live input bus; 0 disables live input.
    pub input_channels: usize,
    /// How long the render thread may wait for the render lock, in
    /// microseconds. 0 means a single `try_lock`.
    pub render_lock_timeout_us: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            quantum_frames: DEFAULT_QUANTUM_FRAMES,
            output_channels: 2,
            input_channels: 0,
            render_lock_timeout_us: 0,
        }
    }
}

impl ContextConfig {
    /// Config with the given sample rate and defaults elsewhere.
    pub fn with_sample_rate(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            ..Self::default()
        }
    }

    /// Check every field against its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(ConfigError::SampleRate(self.sample_rate));
        }
        if self.quantum_frames == 0 || self.quantum_frames > MAX_QUANTUM_FRAMES {
            return Err(ConfigError::QuantumFrames(self.quantum_frames));
        }
        if self.output_channels == 0 || self.output_channels > MAX_CHANNELS {
            return Err(ConfigError::Channels {
                which: "output",
                count: self.output_channels,
            });
        }
        if self.input_channels > MAX_CHANNELS {
            return Err(ConfigError::Channels {
                which: "input",
                count: self.input_channels,
            });
        }
        Ok(())
    }

    /// Render-lock wait budget, or `None` for a plain `try_lock`.
    pub fn render_lock_timeout(&self) -> Option<Duration> {
        (self.render_lock_timeout_us > 0).then(|| Duration::from_micros(self.render_lock_timeout_us))
    }

    /// Duration of one quantum in seconds.
    pub fn quantum_duration(&self) -> f64 {
        self.quantum_frames as f64 / f64::from(self.sample_rate)
    }

    /// Parse and validate a TOML document.
    #[cfg(feature = "serde")]
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}
