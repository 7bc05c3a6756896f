//! Graph and render locks.
//!
//! Two scoped guards split the engine's shared state:
//!
//! - [`GraphLock`] guards topology: the node registry, the deletion queue,
//!   dirty junctions and the automatic-pull set. Every connect, disconnect,
//!   enable, disable and lifecycle transition takes it.
//! - [`RenderLock`] guards what the render pass reads: the quantum counter,
//!   the automatic-pull snapshot and the live input bus. The render thread
//!   holds it for a whole quantum.
//!
//! When both are needed the graph lock is taken first. The render thread is
//! the only exception: it already holds the render lock and only ever
//! *tries* the graph lock at quantum boundaries, which cannot deadlock.
//! Both guards release on drop, on every exit path.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::MutexGuard;

use crate::bus::AudioBus;
use crate::context::ContextInner;
use crate::error::{GraphError, Result};
use crate::graph::{AudioNode, NodeId, NodeInput};

/// Topology state behind the graph lock.
#[derive(Default)]
pub(crate) struct GraphState {
    /// Every node not yet swept, destination included.
    pub(crate) nodes: BTreeMap<NodeId, Arc<AudioNode>>,
    /// Marked nodes waiting for the sweep.
    pub(crate) marked: Vec<Arc<AudioNode>>,
    /// Inputs whose junction changed since the last boundary.
    pub(crate) dirty_inputs: Vec<Weak<NodeInput>>,
    /// Analysis nodes nothing consumes, pulled by the context itself.
    pub(crate) automatic_pull: Vec<Arc<AudioNode>>,
    /// Topology changed since the automatic-pull set was computed.
    pub(crate) automatic_pull_dirty: bool,
    /// A disconnect or disable may have orphaned a node.
    pub(crate) collect_pending: bool,
}

/// Render-visible state behind the render lock.
pub(crate) struct RenderState {
    /// Render-quantum counter, incremented once per `render` call.
    pub(crate) quantum: u64,
    /// Render-side copy of [`GraphState::automatic_pull`].
    pub(crate) automatic_pull: Vec<Arc<AudioNode>>,
    /// Device input captured for this quantum.
    pub(crate) live_input: Option<AudioBus>,
}

impl RenderState {
    pub(crate) fn new(input_channels: usize, quantum_frames: usize) -> Self {
        Self {
            quantum: 0,
            automatic_pull: Vec::new(),
            live_input: (input_channels > 0).then(|| AudioBus::new(input_channels, quantum_frames)),
        }
    }
}

/// Scoped proof that the caller holds the graph lock.
pub struct GraphLock<'a> {
    pub(crate) state: MutexGuard<'a, GraphState>,
    pub(crate) context: &'a ContextInner,
}

impl<'a> GraphLock<'a> {
    pub(crate) fn new(state: MutexGuard<'a, GraphState>, context: &'a ContextInner) -> Self {
        Self { state, context }
    }

    /// Whether a node with this id is registered and not yet swept.
    pub fn contains(&self, id: NodeId) -> bool {
        self.state.nodes.contains_key(&id)
    }

    /// Registered nodes, destination included.
    pub fn node_count(&self) -> usize {
        self.state.nodes.len()
    }

    /// Nodes waiting for the sweep.
    pub fn marked_count(&self) -> usize {
        self.state.marked.len()
    }

    /// Junctions waiting for a refresh.
    pub fn dirty_count(&self) -> usize {
        self.state.dirty_inputs.len()
    }

    /// Mark every node with no handle and no active outgoing connection.
    /// Marked nodes are swept at the next quantum boundary holding both
    /// locks. Returns how many were marked.
    pub fn mark_unreferenced(&mut self) -> usize {
        let context = self.context;
        context.mark_unreferenced(self)
    }

    pub(crate) fn check_owned(&self, node: &AudioNode) -> Result<()> {
        if !node.belongs_to(self.context) {
            return Err(GraphError::ContextMismatch);
        }
        if !self.contains(node.id()) {
            return Err(GraphError::NodeNotFound(node.id()));
        }
        Ok(())
    }

    pub(crate) fn push_dirty(&mut self, input: Weak<NodeInput>) {
        self.state.dirty_inputs.push(input);
    }

    pub(crate) fn topology_changed(&mut self) {
        self.state.automatic_pull_dirty = true;
        self.state.collect_pending = true;
    }

    // ── Node-addressed graph mutations ──────────────────────────────────────

    fn endpoints(
        &self,
        from: &AudioNode,
        output: usize,
        to: &AudioNode,
        input: usize,
    ) -> Result<(Arc<crate::graph::NodeOutput>, Arc<NodeInput>)> {
        self.check_owned(from)?;
        self.check_owned(to)?;
        let out = from
            .output(output)
            .ok_or(GraphError::OutputOutOfRange {
                node: from.id(),
                index: output,
            })?
            .clone();
        let inp = to
            .input(input)
            .ok_or(GraphError::InputOutOfRange {
                node: to.id(),
                index: input,
            })?
            .clone();
        Ok((out, inp))
    }

    /// Connect output `output` of `from` to input `input` of `to`.
    pub fn connect(&mut self, from: &AudioNode, output: usize, to: &AudioNode, input: usize) -> Result<()> {
        let (out, inp) = self.endpoints(from, output, to, input)?;
        NodeInput::connect(self, &inp, &out)
    }

    /// Disconnect one pair. `Ok(false)` when the pair was not connected.
    pub fn disconnect(
        &mut self,
        from: &AudioNode,
        output: usize,
        to: &AudioNode,
        input: usize,
    ) -> Result<bool> {
        let (out, inp) = self.endpoints(from, output, to, input)?;
        Ok(NodeInput::disconnect(self, &inp, &out))
    }

    /// Disconnect output `output` of `from` from every consumer.
    pub fn disconnect_output(&mut self, from: &AudioNode, output: usize) -> Result<()> {
        self.check_owned(from)?;
        let out = from
            .output(output)
            .ok_or(GraphError::OutputOutOfRange {
                node: from.id(),
                index: output,
            })?
            .clone();
        out.disconnect_all(self);
        Ok(())
    }

    /// Keep the connection but stop it contributing to rendering.
    pub fn disable(&mut self, from: &AudioNode, output: usize, to: &AudioNode, input: usize) -> Result<()> {
        let (out, inp) = self.endpoints(from, output, to, input)?;
        NodeInput::disable(self, &inp, &out)
    }

    /// Restore a disabled connection.
    pub fn enable(&mut self, from: &AudioNode, output: usize, to: &AudioNode, input: usize) -> Result<()> {
        let (out, inp) = self.endpoints(from, output, to, input)?;
        NodeInput::enable(self, &inp, &out)
    }
}

/// Scoped proof that the caller holds the render lock.
pub struct RenderLock<'a> {
    pub(crate) state: MutexGuard<'a, RenderState>,
    pub(crate) context: &'a ContextInner,
}

impl<'a> RenderLock<'a> {
    pub(crate) fn new(state: MutexGuard<'a, RenderState>, context: &'a ContextInner) -> Self {
        Self { state, context }
    }

    /// Current render-quantum index.
    #[inline]
    pub fn quantum(&self) -> u64 {
        self.state.quantum
    }

    /// Context sample rate.
    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.context.config.sample_rate
    }

    /// Frames per quantum.
    #[inline]
    pub fn quantum_frames(&self) -> usize {
        self.context.config.quantum_frames
    }

    /// Sample frame at the start of the current quantum.
    #[inline]
    pub fn current_sample_frame(&self) -> u64 {
        self.context.current_sample_frame()
    }

    /// Seconds at the start of the current quantum.
    #[inline]
    pub fn current_time(&self) -> f64 {
        self.context.current_time()
    }

    /// Device input for this quantum, if live input is enabled.
    pub fn live_input(&self) -> Option<&AudioBus> {
        self.state.live_input.as_ref()
    }

    pub(crate) fn begin_quantum(&mut self) {
        self.state.quantum = self.state.quantum.wrapping_add(1);
        if self.state.quantum == u64::MAX {
            self.state.quantum = 0;
        }
    }

    pub(crate) fn fill_live_input(&mut self, source: Option<&AudioBus>) {
        let Some(live) = self.state.live_input.as_mut() else {
            return;
        };
        match source {
            Some(source) if live.same_shape(source) => live.copy_from(source),
            _ => live.zero(),
        }
    }
}
