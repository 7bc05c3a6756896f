//! Node inputs and the pull algorithm.
//!
//! [`NodeInput::pull`] is the core of rendering. Called once per quantum per
//! reachable input, it walks the graph upstream:
//!
//! 1. no active connection: return a zeroed bus (the caller's in-place bus
//!    if given, else the input's own summing bus);
//! 2. one active connection whose channel count matches: render the upstream
//!    node if it has not rendered this quantum and hand back its output bus
//!    unchanged, no copy;
//! 3. otherwise: render every upstream node and mix their buses into the
//!    input's summing bus, following the mixing policy of
//!    [`AudioBus::sum_from`](crate::AudioBus::sum_from).
//!
//! Connection changes go through the static-style associated functions
//! ([`connect`](NodeInput::connect), [`disconnect`](NodeInput::disconnect),
//! [`enable`](NodeInput::enable), [`disable`](NodeInput::disable)), each
//! taking the graph lock. They reach the render thread only when the
//! junction is refreshed at the next quantum boundary.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::bus::{self, AudioBus, SharedBus};
use crate::error::{GraphError, Result};
use crate::lock::{GraphLock, RenderLock};

use super::junction::{SummingJunction, Transition};
use super::node::{AudioNode, NodeId};
use super::output::NodeOutput;
use super::processor::ChannelDemand;

/// One input of a node.
pub struct NodeInput {
    index: usize,
    demand: ChannelDemand,
    junction: SummingJunction,
    summing_bus: SharedBus,
    quantum_frames: usize,
    channels: AtomicUsize,
}

impl NodeInput {
    pub(crate) fn new(
        owner: Weak<AudioNode>,
        index: usize,
        demand: ChannelDemand,
        quantum_frames: usize,
    ) -> Self {
        let channels = match demand {
            ChannelDemand::Explicit(n) => n.max(1),
            ChannelDemand::Max => 1,
        };
        Self {
            index,
            demand,
            junction: SummingJunction::new(owner),
            summing_bus: bus::shared(AudioBus::new(channels, quantum_frames)),
            quantum_frames,
            channels: AtomicUsize::new(channels),
        }
    }

    /// Owning node, unless it has been swept.
    pub fn node(&self) -> Option<Arc<AudioNode>> {
        self.junction.owner()
    }

    /// Position in the owner's input list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Channel demand declared by the node.
    pub fn demand(&self) -> ChannelDemand {
        self.demand
    }

    /// Connection bookkeeping.
    pub fn junction(&self) -> &SummingJunction {
        &self.junction
    }

    /// Rendering channel count: the explicit demand, or the maximum over the
    /// active connections. Recomputed at quantum boundaries after a change.
    pub fn number_of_channels(&self) -> usize {
        self.channels.load(Ordering::Acquire)
    }

    /// Active plus disabled connections.
    pub fn number_of_connections(&self) -> usize {
        self.junction.number_of_connections()
    }

    /// Whether the render thread currently sees any connection.
    pub fn is_connected_for_rendering(&self) -> bool {
        self.junction.number_of_rendering_connections() > 0
    }

    /// Every connected output, active first.
    pub fn all_connections(&self) -> Vec<Arc<NodeOutput>> {
        self.junction.all_outputs()
    }

    /// The internal summing bus.
    pub fn summing_bus(&self) -> &SharedBus {
        &self.summing_bus
    }

    /// Connect `output` into `input`'s active set.
    ///
    /// Rejects a pair that is already connected (active or disabled), a node
    /// marked for deletion, nodes from another context and any edge that
    /// would close a cycle.
    pub fn connect(
        graph: &mut GraphLock<'_>,
        input: &Arc<NodeInput>,
        output: &Arc<NodeOutput>,
    ) -> Result<()> {
        let to = input.node().ok_or(GraphError::Detached)?;
        let from = output.node().ok_or(GraphError::Detached)?;
        graph.check_owned(&to)?;
        graph.check_owned(&from)?;
        if !input.junction.can_update_state() {
            return Err(GraphError::MarkedForDeletion(to.id()));
        }
        if from.is_marked_for_deletion() {
            return Err(GraphError::MarkedForDeletion(from.id()));
        }
        if input.junction.is_connected(output) {
            return Err(GraphError::AlreadyConnected);
        }
        if from.id() == to.id() || can_reach(&to, from.id()) {
            return Err(GraphError::CycleDetected);
        }

        input.junction.insert(output);
        output.add_input(input);
        output.rendering_fan_out_added();
        input.did_update(graph);
        graph.topology_changed();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "graph_connect: {}:{} → {}:{}",
            from.id(),
            output.index(),
            to.id(),
            input.index
        );
        Ok(())
    }

    /// Remove `output` from `input`, whichever set holds it.
    ///
    /// Returns false, changing nothing, when the pair is not connected.
    pub fn disconnect(
        graph: &mut GraphLock<'_>,
        input: &Arc<NodeInput>,
        output: &Arc<NodeOutput>,
    ) -> bool {
        let Some(was_active) = input.junction.remove(output) else {
            return false;
        };
        output.remove_input(input);
        if was_active {
            output.rendering_fan_out_removed();
        }
        input.did_update(graph);
        graph.topology_changed();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "graph_disconnect: {:?} -/- {:?}:{}",
            output,
            input.node().map(|n| n.id()),
            input.index
        );
        true
    }

    /// Move `output` to the disabled set. No-op when already disabled.
    pub fn disable(
        graph: &mut GraphLock<'_>,
        input: &Arc<NodeInput>,
        output: &Arc<NodeOutput>,
    ) -> Result<()> {
        match input.junction.disable(output) {
            Transition::Moved => {
                output.rendering_fan_out_removed();
                input.did_update(graph);
                graph.topology_changed();
                #[cfg(feature = "tracing")]
                tracing::debug!("graph_disable: {:?}", output);
                Ok(())
            }
            Transition::Unchanged => Ok(()),
            Transition::NotConnected => Err(GraphError::NotConnected),
        }
    }

    /// Move `output` back to the active set. No-op when already active.
    pub fn enable(
        graph: &mut GraphLock<'_>,
        input: &Arc<NodeInput>,
        output: &Arc<NodeOutput>,
    ) -> Result<()> {
        if !input.junction.can_update_state() {
            let node = input.node().ok_or(GraphError::Detached)?;
            return Err(GraphError::MarkedForDeletion(node.id()));
        }
        match input.junction.enable(output) {
            Transition::Moved => {
                output.rendering_fan_out_added();
                input.did_update(graph);
                graph.topology_changed();
                #[cfg(feature = "tracing")]
                tracing::debug!("graph_enable: {:?}", output);
                Ok(())
            }
            Transition::Unchanged => Ok(()),
            Transition::NotConnected => Err(GraphError::NotConnected),
        }
    }

    /// Queue this input for a refresh at the next quantum boundary.
    pub(crate) fn did_update(self: &Arc<Self>, graph: &mut GraphLock<'_>) {
        if self.junction.can_update_state() && self.junction.did_update() {
            graph.push_dirty(Arc::downgrade(self));
        }
    }

    /// Publish the active set to the render thread and recompute the
    /// channel count. Quantum boundary only.
    pub(crate) fn update_rendering_state(&self, render: &RenderLock<'_>) {
        let max_channels = self.junction.publish_rendering_state();
        let channels = match self.demand {
            ChannelDemand::Explicit(n) => n.max(1),
            ChannelDemand::Max => max_channels.unwrap_or(1).max(1),
        };
        self.channels.store(channels, Ordering::Release);
        self.update_internal_bus(render);
    }

    /// Resize the summing bus to the current channel count. Quantum boundary only.
    pub fn update_internal_bus(&self, _render: &RenderLock<'_>) {
        let channels = self.number_of_channels();
        let mut bus = self.summing_bus.write();
        if bus.number_of_channels() != channels {
            *bus = AudioBus::new(channels, self.quantum_frames);
        }
    }

    /// Render everything upstream of this input for the current quantum.
    ///
    /// Each upstream node runs at most once per quantum however many paths
    /// reach it. With a single matching connection the returned bus is the
    /// upstream output's own bus.
    pub fn pull(
        &self,
        render: &RenderLock<'_>,
        in_place: Option<&SharedBus>,
        frames: usize,
    ) -> SharedBus {
        let rendering = self.junction.rendering_outputs();
        match rendering.as_slice() {
            [] => {
                let bus = in_place.map_or_else(|| Arc::clone(&self.summing_bus), Arc::clone);
                bus.write().zero();
                bus
            }
            [only] if only.number_of_channels() == self.number_of_channels() => {
                only.pull(render, frames)
            }
            outputs => self.sum_all_connections(render, outputs, frames),
        }
    }

    /// The bus produced by this quantum's [`pull`](Self::pull) with no
    /// in-place bus.
    pub fn bus(&self, _render: &RenderLock<'_>) -> SharedBus {
        let rendering = self.junction.rendering_outputs();
        match rendering.as_slice() {
            [only] if only.number_of_channels() == self.number_of_channels() => {
                Arc::clone(only.bus())
            }
            _ => Arc::clone(&self.summing_bus),
        }
    }

    fn sum_all_connections(
        &self,
        render: &RenderLock<'_>,
        outputs: &[Arc<NodeOutput>],
        frames: usize,
    ) -> SharedBus {
        for output in outputs {
            output.pull(render, frames);
        }
        let mut sum = self.summing_bus.write();
        sum.zero();
        for output in outputs {
            sum.sum_from(&output.bus().read());
        }
        drop(sum);
        Arc::clone(&self.summing_bus)
    }
}

impl core::fmt::Debug for NodeInput {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NodeInput")
            .field("node", &self.node().map(|n| n.id()))
            .field("index", &self.index)
            .field("channels", &self.number_of_channels())
            .field("connections", &self.number_of_connections())
            .finish()
    }
}

/// Whether `target` is reachable downstream of `start`.
fn can_reach(start: &Arc<AudioNode>, target: NodeId) -> bool {
    let mut stack = vec![Arc::clone(start)];
    let mut visited = HashSet::new();
    while let Some(node) = stack.pop() {
        if node.id() == target {
            return true;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        for output in node.outputs() {
            for input in output.consumers() {
                if let Some(next) = input.node() {
                    stack.push(next);
                }
            }
        }
    }
    false
}
