//! Node outputs.
//!
//! A [`NodeOutput`] owns the bus its node renders into and remembers every
//! input it feeds. Its channel count changes only at quantum boundaries,
//! under both locks; the bus cell is kept and its contents replaced, so
//! downstream identity checks survive a reallocation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::bus::{self, AudioBus, SharedBus};
use crate::error::Result;
use crate::lock::{GraphLock, RenderLock};

use super::input::NodeInput;
use super::node::AudioNode;

/// One output of a node.
pub struct NodeOutput {
    node: Weak<AudioNode>,
    index: usize,
    bus: SharedBus,
    quantum_frames: usize,
    channels: AtomicUsize,
    /// Every consumer, active or disabled. Graph lock.
    inputs: Mutex<Vec<Weak<NodeInput>>>,
    /// Consumers holding this output in their active set.
    rendering_fan_out: AtomicUsize,
}

impl NodeOutput {
    pub(crate) fn new(
        node: Weak<AudioNode>,
        index: usize,
        channels: usize,
        quantum_frames: usize,
    ) -> Self {
        Self {
            node,
            index,
            bus: bus::shared(AudioBus::new(channels, quantum_frames)),
            quantum_frames,
            channels: AtomicUsize::new(channels),
            inputs: Mutex::new(Vec::new()),
            rendering_fan_out: AtomicUsize::new(0),
        }
    }

    /// Owning node, unless it has been swept.
    pub fn node(&self) -> Option<Arc<AudioNode>> {
        self.node.upgrade()
    }

    /// Position in the owner's output list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The bus last rendered into. Meaningful only after this quantum's pull
    /// has reached the output.
    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    /// Current channel count of the bus.
    pub fn number_of_channels(&self) -> usize {
        self.channels.load(Ordering::Acquire)
    }

    /// Inputs holding this output in either set.
    pub fn fan_out_count(&self) -> usize {
        self.inputs
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Inputs holding this output in their active set.
    pub fn rendering_fan_out_count(&self) -> usize {
        self.rendering_fan_out.load(Ordering::Acquire)
    }

    /// Live consumer inputs.
    pub fn consumers(&self) -> Vec<Arc<NodeInput>> {
        self.inputs.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Render the owning node for this quantum if needed and return the bus.
    pub fn pull(&self, render: &RenderLock<'_>, frames: usize) -> SharedBus {
        match self.node.upgrade() {
            Some(node) => node.process_if_necessary(render, frames),
            None => self.bus.write().zero(),
        }
        Arc::clone(&self.bus)
    }

    /// Feed `input` from this output.
    pub fn connect(self: &Arc<Self>, graph: &mut GraphLock<'_>, input: &Arc<NodeInput>) -> Result<()> {
        NodeInput::connect(graph, input, self)
    }

    /// Stop feeding `input`. Returns false if they were not connected.
    pub fn disconnect(self: &Arc<Self>, graph: &mut GraphLock<'_>, input: &Arc<NodeInput>) -> bool {
        NodeInput::disconnect(graph, input, self)
    }

    /// Stop feeding every consumer.
    pub fn disconnect_all(self: &Arc<Self>, graph: &mut GraphLock<'_>) {
        for input in self.consumers() {
            NodeInput::disconnect(graph, &input, self);
        }
    }

    /// Move this output to the disabled set of every consumer.
    pub fn disable_all(self: &Arc<Self>, graph: &mut GraphLock<'_>) {
        for input in self.consumers() {
            // Every consumer holds this output, so NotConnected cannot occur.
            let _ = NodeInput::disable(graph, &input, self);
        }
    }

    /// Move this output back to the active set of every consumer.
    pub fn enable_all(self: &Arc<Self>, graph: &mut GraphLock<'_>) {
        for input in self.consumers() {
            let _ = NodeInput::enable(graph, &input, self);
        }
    }

    pub(crate) fn add_input(&self, input: &Arc<NodeInput>) {
        let mut inputs = self.inputs.lock();
        inputs.retain(|w| w.strong_count() > 0);
        inputs.push(Arc::downgrade(input));
    }

    pub(crate) fn remove_input(&self, input: &Arc<NodeInput>) {
        let target = Arc::downgrade(input);
        self.inputs
            .lock()
            .retain(|w| w.strong_count() > 0 && !Weak::ptr_eq(w, &target));
    }

    pub(crate) fn rendering_fan_out_added(&self) {
        self.rendering_fan_out.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn rendering_fan_out_removed(&self) {
        let _ = self
            .rendering_fan_out
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Reallocate the bus for a new channel count and flag every consumer.
    pub(crate) fn set_number_of_channels(
        &self,
        graph: &mut GraphLock<'_>,
        _render: &RenderLock<'_>,
        channels: usize,
    ) {
        let channels = channels.max(1);
        if channels == self.number_of_channels() {
            return;
        }
        *self.bus.write() = AudioBus::new(channels, self.quantum_frames);
        self.channels.store(channels, Ordering::Release);
        for input in self.consumers() {
            input.did_update(graph);
        }
    }
}

impl core::fmt::Debug for NodeOutput {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NodeOutput")
            .field("node", &self.node.upgrade().map(|n| n.id()))
            .field("index", &self.index)
            .field("channels", &self.number_of_channels())
            .finish()
    }
}
