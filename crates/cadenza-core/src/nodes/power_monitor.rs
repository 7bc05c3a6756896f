//! RMS power meter.
//!
//! [`PowerMonitorNode`] is an analysis node: it passes its input through
//! unchanged and publishes the RMS level of the last quantum, in dB, to a
//! [`PowerMeter`] the control thread reads. Left unconnected downstream it
//! is still rendered every quantum by the context's automatic pull.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::graph::{AudioProcessor, NodeKind, NodeLayout, ProcessScope};

/// Default number of trailing frames measured per quantum.
pub const DEFAULT_WINDOW: usize = 128;

/// RMS floor, about -78 dB. Silence and non-finite input read as this.
pub const MIN_POWER: f32 = 0.000125;

/// Control-side view of a power monitor's reading.
#[derive(Debug, Clone)]
pub struct PowerMeter {
    db: Arc<AtomicU32>,
}

impl PowerMeter {
    /// Most recent level in dB. 0 dB before the first measurement and after
    /// a reset.
    pub fn db(&self) -> f32 {
        f32::from_bits(self.db.load(Ordering::Acquire))
    }
}

/// Pass-through node measuring RMS power.
#[derive(Debug)]
pub struct PowerMonitorNode {
    window: usize,
    db: Arc<AtomicU32>,
}

impl PowerMonitorNode {
    /// Meter over the last [`DEFAULT_WINDOW`] frames of each quantum.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Meter over the last `window` frames of each quantum.
    pub fn with_window(window: usize) -> Self {
        Self {
            window: window.max(1),
            db: Arc::new(AtomicU32::new(0.0_f32.to_bits())),
        }
    }

    /// Handle for reading the level.
    pub fn meter(&self) -> PowerMeter {
        PowerMeter {
            db: Arc::clone(&self.db),
        }
    }
}

impl Default for PowerMonitorNode {
    fn default() -> Self {
        Self::new()
    }
}

/// RMS of the trailing `window` frames across all channels, in dB.
pub fn rms_db<'a>(channels: impl Iterator<Item = &'a [f32]>, window: usize) -> f32 {
    let mut power = 0.0_f32;
    let mut count = 0_usize;
    for channel in channels {
        let start = channel.len().saturating_sub(window);
        power += channel[start..].iter().map(|s| s * s).sum::<f32>();
        count += channel.len() - start;
    }
    let rms = if count == 0 {
        0.0
    } else {
        (power / count as f32).sqrt()
    };
    let rms = if rms.is_finite() { rms.max(MIN_POWER) } else { MIN_POWER };
    20.0 * rms.log10()
}

impl AudioProcessor for PowerMonitorNode {
    fn name(&self) -> &'static str {
        "power_monitor"
    }

    fn layout(&self) -> NodeLayout {
        NodeLayout::effect()
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Analysis
    }

    // Silence has to be measured too.
    fn propagates_silence(&self) -> bool {
        false
    }

    fn reset(&mut self) {
        self.db.store(0.0_f32.to_bits(), Ordering::Release);
    }

    fn process(&mut self, scope: &mut ProcessScope<'_, '_>) {
        let input = scope.input(0);
        let output = scope.output(0);
        let input = input.read();
        let mut output = output.write();

        if !scope.is_input_connected(0) {
            output.zero();
            return;
        }
        let db = rms_db(input.channels(), self.window);
        self.db.store(db.to_bits(), Ordering::Release);
        output.mix_from(&input);
    }
}
