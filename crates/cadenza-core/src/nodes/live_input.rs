//! Device input as a graph source.

use crate::graph::{AudioProcessor, NodeKind, NodeLayout, ProcessScope};

/// Emits the samples handed to [`AudioContext::render`](crate::AudioContext::render)
/// as `source`, mixed to `channels`. Silent when live input is disabled in
/// the context config or no source was supplied for the quantum.
#[derive(Debug, Clone, Copy)]
pub struct LiveInputNode {
    channels: usize,
}

impl LiveInputNode {
    /// Live input with `channels` output channels.
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
        }
    }
}

impl AudioProcessor for LiveInputNode {
    fn name(&self) -> &'static str {
        "live_input"
    }

    fn layout(&self) -> NodeLayout {
        NodeLayout::source(self.channels)
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Source
    }

    fn process(&mut self, scope: &mut ProcessScope<'_, '_>) {
        let output = scope.output(0);
        let mut bus = output.write();
        match scope.live_input() {
            Some(live) if live.length() == bus.length() => bus.mix_from(live),
            _ => bus.zero(),
        }
    }
}
