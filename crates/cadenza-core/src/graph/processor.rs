//! The per-node processing contract.
//!
//! Concrete DSP lives behind [`AudioProcessor`]. The engine owns the node
//! around it: connection bookkeeping, memoized pulls, silence propagation and
//! lifecycle. A processor only declares its shape with [`NodeLayout`] and
//! renders one quantum at a time through a [`ProcessScope`].

use std::sync::Arc;

use crate::bus::{AudioBus, SharedBus};
use crate::lock::RenderLock;

use super::node::AudioNode;

/// Role of a node in the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Produces sound on its own (oscillator, live input). Never propagates silence.
    Source,
    /// Transforms its inputs.
    Effect,
    /// Pass-through inspector. Pulled automatically when nothing consumes its output.
    Analysis,
    /// The context's sink. Owned by the context and never deleted.
    Destination,
}

/// How an input decides its rendering channel count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelDemand {
    /// Maximum channel count over the active connections, or 1 when unconnected.
    Max,
    /// Always this many channels; sources are up- or down-mixed to fit.
    Explicit(usize),
}

/// How an output decides its channel count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputChannels {
    /// Always this many channels.
    Fixed(usize),
    /// Tracks the computed channel count of the given input.
    FollowInput(usize),
}

/// Inputs and outputs of a node, fixed for its lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeLayout {
    /// One entry per input.
    pub inputs: Vec<ChannelDemand>,
    /// One entry per output.
    pub outputs: Vec<OutputChannels>,
}

impl NodeLayout {
    /// No inputs, one output with a fixed channel count.
    pub fn source(channels: usize) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: vec![OutputChannels::Fixed(channels)],
        }
    }

    /// One input, one output following it.
    pub fn effect() -> Self {
        Self {
            inputs: vec![ChannelDemand::Max],
            outputs: vec![OutputChannels::FollowInput(0)],
        }
    }

    /// One input with the given demand, no outputs.
    pub fn sink(demand: ChannelDemand) -> Self {
        Self {
            inputs: vec![demand],
            outputs: Vec::new(),
        }
    }
}

/// DSP behaviour plugged into a graph node.
///
/// `process` runs on the render thread once per quantum at most. It must not
/// block, allocate in the common case, or take locks shared with the control
/// thread; resources prepared elsewhere arrive through
/// [`Staged`](crate::Staged), consumed at the top of `process`.
///
/// `reset` also runs on the render thread, at the top of the next render
/// after [`AudioNode::reset`](crate::AudioNode::reset). The timing getters
/// (`tail_time`, `latency_time`, `propagates_silence`) are read after every
/// `process` and cached on the node. `initialize` and `uninitialize` run
/// while the node cannot be rendered.
pub trait AudioProcessor: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Input and output shape.
    fn layout(&self) -> NodeLayout;

    /// Role of the node.
    fn kind(&self) -> NodeKind {
        NodeKind::Effect
    }

    /// Allocate per-node resources.
    fn initialize(&mut self, _sample_rate: f32, _quantum_frames: usize) {}

    /// Release per-node resources.
    fn uninitialize(&mut self) {}

    /// Render `scope.frames()` frames from the inputs into every output bus.
    fn process(&mut self, scope: &mut ProcessScope<'_, '_>);

    /// Clear internal state (filter memory, schedules) without deallocating.
    fn reset(&mut self) {}

    /// Seconds of output after the input goes silent.
    fn tail_time(&self) -> f64 {
        0.0
    }

    /// Seconds of delay introduced.
    fn latency_time(&self) -> f64 {
        0.0
    }

    /// Whether silent inputs may produce silent output without calling
    /// `process`. Sources must return `false`.
    fn propagates_silence(&self) -> bool {
        !matches!(self.kind(), NodeKind::Source)
    }
}

/// Render-thread view handed to [`AudioProcessor::process`].
pub struct ProcessScope<'s, 'g> {
    node: &'s AudioNode,
    render: &'s RenderLock<'g>,
    frames: usize,
    finished: bool,
}

impl<'s, 'g> ProcessScope<'s, 'g> {
    pub(crate) fn new(node: &'s AudioNode, render: &'s RenderLock<'g>, frames: usize) -> Self {
        Self {
            node,
            render,
            frames,
            finished: false,
        }
    }

    /// Frames to render this quantum.
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Context sample rate.
    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.render.sample_rate()
    }

    /// Sample frame at the start of this quantum.
    #[inline]
    pub fn current_sample_frame(&self) -> u64 {
        self.render.current_sample_frame()
    }

    /// Time in seconds at the start of this quantum.
    #[inline]
    pub fn current_time(&self) -> f64 {
        self.render.current_time()
    }

    /// The render lock held for this quantum.
    pub fn render_lock(&self) -> &RenderLock<'g> {
        self.render
    }

    /// Bus rendered by input `index` this quantum.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range for the node's layout.
    pub fn input(&self, index: usize) -> SharedBus {
        self.node.inputs()[index].bus(self.render)
    }

    /// Whether input `index` has any connection taking part in rendering.
    pub fn is_input_connected(&self, index: usize) -> bool {
        self.node
            .inputs()
            .get(index)
            .is_some_and(|input| input.is_connected_for_rendering())
    }

    /// Bus for output `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range for the node's layout.
    pub fn output(&self, index: usize) -> SharedBus {
        Arc::clone(self.node.outputs()[index].bus())
    }

    /// Samples captured from the device this quantum, if live input is enabled.
    pub fn live_input(&self) -> Option<&AudioBus> {
        self.render.live_input()
    }

    /// Report that this source has finished for good. Its outputs are
    /// disabled at the next quantum boundary.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }
}
