//! Graph nodes and control-side handles.
//!
//! An [`AudioNode`] wraps an [`AudioProcessor`] with the engine-side state the
//! render pass needs: inputs, outputs, lifecycle, the index of the last
//! quantum it rendered and the last time it saw non-silent input.
//!
//! Nodes are shared through `Arc`. The context's registry keeps every live
//! node; [`NodeRef`] handles count control-side interest. A node with no
//! handles and no active outgoing connection is marked for deletion and
//! swept at the next quantum boundary where both locks are held.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context::ContextInner;
use crate::lock::{GraphLock, RenderLock};

use super::input::NodeInput;
use super::output::NodeOutput;
use super::processor::{AudioProcessor, NodeKind, OutputChannels, ProcessScope};

/// Unique identifier for a node within one context.
///
/// Node IDs are assigned sequentially and never reused within a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Returns the raw numeric identifier.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Lifecycle of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Created, resources not yet allocated.
    Uninitialized = 0,
    /// Taking part in the graph.
    Initialized = 1,
    /// Unreferenced and waiting for the sweep.
    MarkedForDeletion = 2,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Initialized,
            2 => Self::MarkedForDeletion,
            _ => Self::Uninitialized,
        }
    }
}

/// Quantum index a fresh node has never rendered.
const NEVER_PROCESSED: u64 = u64::MAX;

/// A processing node in the graph.
pub struct AudioNode {
    id: NodeId,
    name: &'static str,
    kind: NodeKind,
    context: Weak<ContextInner>,
    this: Weak<AudioNode>,
    inputs: Vec<Arc<NodeInput>>,
    outputs: Vec<Arc<NodeOutput>>,
    output_rules: Vec<OutputChannels>,
    lifecycle: AtomicU8,
    handles: AtomicUsize,
    last_processed: AtomicU64,
    /// f64 bits, seconds.
    last_non_silent_time: AtomicU64,
    /// Processor timing, f64 bits. Refreshed by the render thread after each
    /// `process` so control-side reads never touch the processor.
    tail_time: AtomicU64,
    latency_time: AtomicU64,
    silence_allowed: AtomicBool,
    reset_pending: AtomicBool,
    finish_reported: AtomicBool,
    processor: Mutex<Box<dyn AudioProcessor>>,
}

impl AudioNode {
    pub(crate) fn new(
        id: NodeId,
        context: Weak<ContextInner>,
        processor: Box<dyn AudioProcessor>,
        quantum_frames: usize,
    ) -> Arc<Self> {
        let layout = processor.layout();
        let name = processor.name();
        let kind = processor.kind();
        let tail_time = processor.tail_time();
        let latency_time = processor.latency_time();
        let silence_allowed = processor.propagates_silence();
        Arc::new_cyclic(|this: &Weak<AudioNode>| {
            let inputs = layout
                .inputs
                .iter()
                .enumerate()
                .map(|(index, demand)| {
                    Arc::new(NodeInput::new(this.clone(), index, *demand, quantum_frames))
                })
                .collect();
            let outputs = layout
                .outputs
                .iter()
                .enumerate()
                .map(|(index, rule)| {
                    let channels = match *rule {
                        OutputChannels::Fixed(n) => n.max(1),
                        OutputChannels::FollowInput(_) => 1,
                    };
                    Arc::new(NodeOutput::new(this.clone(), index, channels, quantum_frames))
                })
                .collect();
            Self {
                id,
                name,
                kind,
                context,
                this: this.clone(),
                inputs,
                outputs,
                output_rules: layout.outputs,
                lifecycle: AtomicU8::new(Lifecycle::Uninitialized as u8),
                handles: AtomicUsize::new(0),
                last_processed: AtomicU64::new(NEVER_PROCESSED),
                last_non_silent_time: AtomicU64::new((-1.0_f64).to_bits()),
                tail_time: AtomicU64::new(tail_time.to_bits()),
                latency_time: AtomicU64::new(latency_time.to_bits()),
                silence_allowed: AtomicBool::new(silence_allowed),
                reset_pending: AtomicBool::new(false),
                finish_reported: AtomicBool::new(false),
                processor: Mutex::new(processor),
            }
        })
    }

    /// Node identifier.
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Processor name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Node role.
    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// All inputs, in layout order.
    #[inline]
    pub fn inputs(&self) -> &[Arc<NodeInput>] {
        &self.inputs
    }

    /// All outputs, in layout order.
    #[inline]
    pub fn outputs(&self) -> &[Arc<NodeOutput>] {
        &self.outputs
    }

    /// Input `index`, if present.
    pub fn input(&self, index: usize) -> Option<&Arc<NodeInput>> {
        self.inputs.get(index)
    }

    /// Output `index`, if present.
    pub fn output(&self, index: usize) -> Option<&Arc<NodeOutput>> {
        self.outputs.get(index)
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Whether the node has been initialized and not yet marked.
    pub fn is_initialized(&self) -> bool {
        self.lifecycle() == Lifecycle::Initialized
    }

    /// Whether the node is waiting for the sweep.
    pub fn is_marked_for_deletion(&self) -> bool {
        self.lifecycle() == Lifecycle::MarkedForDeletion
    }

    /// Number of live control-side handles.
    pub fn handle_count(&self) -> usize {
        self.handles.load(Ordering::Acquire)
    }

    /// Quantum index this node last rendered, if any.
    pub fn last_processed_quantum(&self) -> Option<u64> {
        let q = self.last_processed.load(Ordering::Acquire);
        (q != NEVER_PROCESSED).then_some(q)
    }

    /// Declared tail time in seconds, as of the node's last render.
    pub fn tail_time(&self) -> f64 {
        f64::from_bits(self.tail_time.load(Ordering::Acquire))
    }

    /// Declared latency in seconds, as of the node's last render.
    pub fn latency_time(&self) -> f64 {
        f64::from_bits(self.latency_time.load(Ordering::Acquire))
    }

    /// Whether silent input at `now` may be answered with silent output
    /// without rendering: the processor allows it and the tail has run out.
    pub fn propagates_silence(&self, now: f64) -> bool {
        self.silence_allowed.load(Ordering::Acquire)
            && self.last_non_silent_time() + self.latency_time() + self.tail_time() < now
    }

    fn last_non_silent_time(&self) -> f64 {
        f64::from_bits(self.last_non_silent_time.load(Ordering::Acquire))
    }

    /// Clear processor state. The processor's `reset` runs on the render
    /// thread at the top of the node's next render.
    pub fn reset(&self, _graph: &GraphLock<'_>) {
        self.reset_pending.store(true, Ordering::Release);
        self.last_non_silent_time
            .store((-1.0_f64).to_bits(), Ordering::Release);
    }

    /// Whether a [`reset`](Self::reset) is waiting for the next render.
    pub fn is_reset_pending(&self) -> bool {
        self.reset_pending.load(Ordering::Acquire)
    }

    fn refresh_timing(&self, processor: &dyn AudioProcessor) {
        self.tail_time
            .store(processor.tail_time().to_bits(), Ordering::Release);
        self.latency_time
            .store(processor.latency_time().to_bits(), Ordering::Release);
        self.silence_allowed
            .store(processor.propagates_silence(), Ordering::Release);
    }

    // Besides the render path, the processor lock is taken only here and in
    // `uninitialize`, while the node is unreachable or both locks are held.
    pub(crate) fn initialize(&self, sample_rate: f32, quantum_frames: usize) {
        if self.lifecycle() != Lifecycle::Uninitialized {
            return;
        }
        let mut processor = self.processor.lock();
        processor.initialize(sample_rate, quantum_frames);
        self.refresh_timing(&**processor);
        drop(processor);
        self.lifecycle
            .store(Lifecycle::Initialized as u8, Ordering::Release);
    }

    pub(crate) fn uninitialize(&self) {
        if self.lifecycle() == Lifecycle::Uninitialized {
            return;
        }
        self.processor.lock().uninitialize();
        self.lifecycle
            .store(Lifecycle::Uninitialized as u8, Ordering::Release);
    }

    pub(crate) fn mark_for_deletion(&self) -> bool {
        self.lifecycle
            .compare_exchange(
                Lifecycle::Initialized as u8,
                Lifecycle::MarkedForDeletion as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn belongs_to(&self, context: &ContextInner) -> bool {
        core::ptr::eq(self.context.as_ptr(), context)
    }

    /// Outputs that still feed an input's active set.
    pub(crate) fn rendering_fan_out(&self) -> usize {
        self.outputs
            .iter()
            .map(|output| output.rendering_fan_out_count())
            .sum()
    }

    pub(crate) fn has_input_connections(&self) -> bool {
        self.inputs.iter().any(|input| input.number_of_connections() > 0)
    }

    /// Render this node for the current quantum unless it already has.
    ///
    /// Pulls every input first, then either silences the outputs (silent
    /// inputs on a node that propagates silence) or calls the processor.
    pub(crate) fn process_if_necessary(&self, render: &RenderLock<'_>, frames: usize) {
        let quantum = render.quantum();
        if self.last_processed.swap(quantum, Ordering::AcqRel) == quantum {
            return;
        }
        if self.lifecycle() == Lifecycle::Uninitialized {
            self.silence_outputs();
            return;
        }

        for input in &self.inputs {
            input.pull(render, None, frames);
        }

        let now = render.current_time();
        let silent_inputs = self.inputs_are_silent(render);
        if !silent_inputs {
            let end = now + frames as f64 / f64::from(render.sample_rate());
            self.last_non_silent_time
                .store(end.to_bits(), Ordering::Release);
        }

        let Some(mut processor) = self.processor.try_lock() else {
            self.silence_outputs();
            return;
        };
        if self.reset_pending.swap(false, Ordering::AcqRel) {
            processor.reset();
        }
        if silent_inputs && self.propagates_silence(now) {
            drop(processor);
            self.silence_outputs();
            return;
        }

        let mut scope = ProcessScope::new(self, render, frames);
        processor.process(&mut scope);
        self.refresh_timing(&**processor);
        drop(processor);
        self.unsilence_outputs();

        if scope.is_finished() {
            self.report_finished();
        }
    }

    fn inputs_are_silent(&self, render: &RenderLock<'_>) -> bool {
        self.inputs
            .iter()
            .all(|input| input.bus(render).read().is_silent())
    }

    fn silence_outputs(&self) {
        for output in &self.outputs {
            output.bus().write().zero();
        }
    }

    fn unsilence_outputs(&self) {
        for output in &self.outputs {
            output.bus().write().set_silent(false);
        }
    }

    fn report_finished(&self) {
        if self.finish_reported.load(Ordering::Acquire) {
            return;
        }
        if let Some(context) = self.context.upgrade()
            && context.queue_finished(self.this.clone())
        {
            self.finish_reported.store(true, Ordering::Release);
        }
    }

    /// Re-derive the channel count of every output following `input_index`.
    /// Consumers of an output whose count changed are flagged dirty.
    pub(crate) fn check_number_of_channels_for_input(
        &self,
        graph: &mut GraphLock<'_>,
        render: &RenderLock<'_>,
        input_index: usize,
    ) {
        let Some(input) = self.inputs.get(input_index) else {
            return;
        };
        let channels = input.number_of_channels();
        for (output, rule) in self.outputs.iter().zip(&self.output_rules) {
            if *rule == OutputChannels::FollowInput(input_index)
                && output.number_of_channels() != channels
            {
                output.set_number_of_channels(graph, render, channels);
            }
        }
    }

    /// Sever every connection into and out of this node, disabled ones included.
    pub(crate) fn disconnect_all(&self, graph: &mut GraphLock<'_>) {
        for input in &self.inputs {
            for output in input.all_connections() {
                NodeInput::disconnect(graph, input, &output);
            }
        }
        for output in &self.outputs {
            output.disconnect_all(graph);
        }
    }
}

impl core::fmt::Debug for AudioNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AudioNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

/// Counted control-side handle to a node.
///
/// Dropping the last handle does not free the node: it only makes it a
/// candidate for deletion, which happens once it also has no active outgoing
/// connection.
pub struct NodeRef {
    node: Arc<AudioNode>,
}

impl NodeRef {
    pub(crate) fn new(node: Arc<AudioNode>) -> Self {
        node.handles.fetch_add(1, Ordering::AcqRel);
        Self { node }
    }

    /// The shared node.
    pub fn node(&self) -> &Arc<AudioNode> {
        &self.node
    }

    /// Weak reference that does not count as a handle.
    pub fn downgrade(&self) -> Weak<AudioNode> {
        Arc::downgrade(&self.node)
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.node))
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        if self.node.handles.fetch_sub(1, Ordering::AcqRel) == 1
            && let Some(context) = self.node.context.upgrade()
        {
            #[cfg(feature = "tracing")]
            tracing::debug!("node_released: {} ({})", self.node.id, self.node.name);
            context.note_released();
        }
    }
}

impl core::ops::Deref for NodeRef {
    type Target = AudioNode;

    fn deref(&self) -> &AudioNode {
        &self.node
    }
}

impl core::fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("NodeRef").field(&self.node.id).finish()
    }
}
