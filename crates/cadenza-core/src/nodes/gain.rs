//! Gain node.

use std::sync::Arc;

use crate::graph::{AudioProcessor, NodeLayout, ProcessScope};
use crate::param::AudioParam;

/// Upper bound for the gain parameter (+24 dB).
const MAX_GAIN: f32 = 16.0;

/// Multiplies its input by a gain parameter. The output follows the input's
/// channel count.
#[derive(Debug)]
pub struct GainNode {
    gain: Arc<AudioParam>,
}

impl GainNode {
    /// Create a gain node with linear gain `gain`.
    pub fn new(gain: f32) -> Self {
        Self {
            gain: Arc::new(AudioParam::new("gain", gain, 0.0, MAX_GAIN)),
        }
    }

    /// The gain parameter, shared with the render side.
    pub fn gain(&self) -> Arc<AudioParam> {
        Arc::clone(&self.gain)
    }
}

impl Default for GainNode {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl AudioProcessor for GainNode {
    fn name(&self) -> &'static str {
        "gain"
    }

    fn layout(&self) -> NodeLayout {
        NodeLayout::effect()
    }

    fn process(&mut self, scope: &mut ProcessScope<'_, '_>) {
        let input = scope.input(0);
        let output = scope.output(0);
        let input = input.read();
        let mut output = output.write();
        output.mix_from(&input);
        output.scale(self.gain.value());
    }
}
