//! The audio context: graph owner and render driver.
//!
//! [`AudioContext`] owns the destination node, the node registry and both
//! locks. The platform audio callback calls [`AudioContext::render`] once per
//! quantum; the control thread creates nodes and rewires them under the
//! graph lock.
//!
//! # Quantum boundaries
//!
//! Housekeeping happens around each quantum, and only when the render thread
//! wins a `try_lock` on the graph lock. If it loses, the work waits for the
//! next quantum and rendering goes on with the previous topology.
//!
//! - **Before rendering**: refresh dirty junctions, propagate channel counts,
//!   republish the automatic-pull set.
//! - **After rendering**: disable the outputs of finished sources, mark
//!   unreferenced nodes, sweep marked nodes, then refresh again.
//!
//! # Deferred deletion
//!
//! Dropping the last [`NodeRef`] only raises a flag. Marking runs under the
//! graph lock; the sweep runs with both locks held, so a node is never freed
//! while a render pass can still reach it.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::bus::AudioBus;
use crate::config::ContextConfig;
use crate::error::{ConfigError, GraphError, Result};
use crate::graph::{
    AudioNode, AudioProcessor, ChannelDemand, NodeId, NodeKind, NodeLayout, NodeRef, ProcessScope,
};
use crate::lock::{GraphLock, GraphState, RenderLock, RenderState};

const DESTINATION_ID: NodeId = NodeId(0);

/// Reasons the render driver substituted silence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum RenderWarning {
    Shape = 1,
    Contention = 2,
    Stopped = 4,
}

impl RenderWarning {
    #[cfg(feature = "tracing")]
    fn describe(self) -> &'static str {
        match self {
            Self::Shape => "destination bus does not match the context layout",
            Self::Contention => "render lock unavailable",
            Self::Stopped => "context is stopped",
        }
    }
}

/// Sink at the root of every pull. The render driver reads its input
/// directly, so `process` has nothing to do.
struct DestinationProcessor {
    channels: usize,
}

impl AudioProcessor for DestinationProcessor {
    fn name(&self) -> &'static str {
        "destination"
    }

    fn layout(&self) -> NodeLayout {
        NodeLayout::sink(ChannelDemand::Explicit(self.channels))
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Destination
    }

    fn process(&mut self, _scope: &mut ProcessScope<'_, '_>) {}
}

/// State shared by every handle to one context.
pub(crate) struct ContextInner {
    pub(crate) config: ContextConfig,
    graph: Mutex<GraphState>,
    render: Mutex<RenderState>,
    destination: Arc<AudioNode>,
    next_id: AtomicU32,
    current_frame: AtomicU64,
    running: AtomicBool,
    released: AtomicBool,
    finished: Mutex<Vec<Weak<AudioNode>>>,
    warned: AtomicU8,
    silent_renders: AtomicU64,
}

impl ContextInner {
    pub(crate) fn current_sample_frame(&self) -> u64 {
        self.current_frame.load(Ordering::Acquire)
    }

    pub(crate) fn current_time(&self) -> f64 {
        self.current_sample_frame() as f64 / f64::from(self.config.sample_rate)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// A handle count reached zero. Safe from any thread, never blocks.
    pub(crate) fn note_released(&self) {
        self.released.store(true, Ordering::Release);
    }

    /// Queue a finished source from the render thread. False if the queue
    /// is contended; the source reports again next quantum.
    pub(crate) fn queue_finished(&self, node: Weak<AudioNode>) -> bool {
        self.finished.try_lock().map(|mut q| q.push(node)).is_some()
    }

    fn graph_lock(&self) -> GraphLock<'_> {
        GraphLock::new(self.graph.lock(), self)
    }

    fn render_lock(&self) -> RenderLock<'_> {
        RenderLock::new(self.render.lock(), self)
    }

    fn try_graph_lock(&self) -> Option<GraphLock<'_>> {
        self.graph.try_lock().map(|state| GraphLock::new(state, self))
    }

    fn try_render_lock(&self) -> Option<RenderLock<'_>> {
        let guard = match self.config.render_lock_timeout() {
            Some(timeout) => self.render.try_lock_for(timeout),
            None => self.render.try_lock(),
        };
        guard.map(|state| RenderLock::new(state, self))
    }

    fn render_silence(&self, destination: &mut AudioBus, warning: RenderWarning) {
        destination.zero();
        self.silent_renders.fetch_add(1, Ordering::AcqRel);
        let bit = warning as u8;
        if self.warned.fetch_or(bit, Ordering::AcqRel) & bit == 0 {
            #[cfg(feature = "tracing")]
            tracing::warn!("render: {}, substituting silence", warning.describe());
        }
    }

    // ── Quantum-boundary housekeeping ───────────────────────────────────────

    fn handle_pre_render_tasks(&self, graph: &mut GraphLock<'_>, render: &mut RenderLock<'_>) {
        self.handle_dirty_inputs(graph, render);
        self.update_automatic_pull_nodes(graph, render);
    }

    fn handle_post_render_tasks(&self, graph: &mut GraphLock<'_>, render: &mut RenderLock<'_>) {
        self.disable_finished_sources(graph);
        self.mark_unreferenced(graph);
        self.delete_marked(graph);
        self.handle_dirty_inputs(graph, render);
        self.update_automatic_pull_nodes(graph, render);
    }

    /// Publish every dirty junction, following channel-count changes
    /// downstream until nothing changes.
    fn handle_dirty_inputs(&self, graph: &mut GraphLock<'_>, render: &RenderLock<'_>) {
        while let Some(weak) = graph.state.dirty_inputs.pop() {
            let Some(input) = weak.upgrade() else {
                continue;
            };
            if !input.junction().can_update_state() {
                input.junction().clear_dirty();
                continue;
            }
            input.update_rendering_state(render);
            if let Some(node) = input.node() {
                node.check_number_of_channels_for_input(graph, render, input.index());
            }
        }
    }

    fn update_automatic_pull_nodes(&self, graph: &mut GraphLock<'_>, render: &mut RenderLock<'_>) {
        if !graph.state.automatic_pull_dirty {
            return;
        }
        graph.state.automatic_pull_dirty = false;
        let pulled: Vec<Arc<AudioNode>> = graph
            .state
            .nodes
            .values()
            .filter(|node| {
                node.kind() == NodeKind::Analysis
                    && node.rendering_fan_out() == 0
                    && node.has_input_connections()
            })
            .cloned()
            .collect();
        render.state.automatic_pull.clone_from(&pulled);
        graph.state.automatic_pull = pulled;
    }

    fn process_automatic_pull_nodes(&self, render: &RenderLock<'_>, frames: usize) {
        for node in &render.state.automatic_pull {
            node.process_if_necessary(render, frames);
        }
    }

    fn disable_finished_sources(&self, graph: &mut GraphLock<'_>) {
        let finished: Vec<Weak<AudioNode>> = std::mem::take(&mut *self.finished.lock());
        for node in finished.iter().filter_map(Weak::upgrade) {
            #[cfg(feature = "tracing")]
            tracing::debug!("source_finished: {} ({})", node.id(), node.name());
            for output in node.outputs() {
                output.disable_all(graph);
            }
        }
    }

    /// Mark every node with no handle and no active outgoing connection.
    pub(crate) fn mark_unreferenced(&self, graph: &mut GraphLock<'_>) -> usize {
        let released = self.released.swap(false, Ordering::AcqRel);
        if !released && !graph.state.collect_pending {
            return 0;
        }
        graph.state.collect_pending = false;
        let candidates: Vec<Arc<AudioNode>> = graph
            .state
            .nodes
            .values()
            .filter(|node| {
                node.kind() != NodeKind::Destination
                    && node.handle_count() == 0
                    && node.rendering_fan_out() == 0
            })
            .cloned()
            .collect();
        let mut marked = 0;
        for node in candidates {
            if node.mark_for_deletion() {
                #[cfg(feature = "tracing")]
                tracing::debug!("node_marked: {} ({})", node.id(), node.name());
                graph.state.marked.push(node);
                marked += 1;
            }
        }
        marked
    }

    /// Sweep marked nodes. Callers hold the render lock too.
    fn delete_marked(&self, graph: &mut GraphLock<'_>) {
        loop {
            let marked = std::mem::take(&mut graph.state.marked);
            if marked.is_empty() {
                break;
            }
            for node in marked {
                node.disconnect_all(graph);
                node.uninitialize();
                graph.state.nodes.remove(&node.id());
                graph.state.automatic_pull.retain(|n| n.id() != node.id());
                graph.state.automatic_pull_dirty = true;
                #[cfg(feature = "tracing")]
                tracing::debug!("node_swept: {} ({})", node.id(), node.name());
            }
            // Severed connections may have orphaned upstream nodes.
            self.mark_unreferenced(graph);
        }
    }
}

/// Handle to an audio graph and its render driver.
///
/// Cloning is cheap; all clones share one graph.
#[derive(Clone)]
pub struct AudioContext {
    inner: Arc<ContextInner>,
}

impl AudioContext {
    /// Create a running context with an initialized destination node.
    pub fn new(config: ContextConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let frames = config.quantum_frames;
        let channels = config.output_channels;
        let inner = Arc::new_cyclic(|weak: &Weak<ContextInner>| {
            let destination = AudioNode::new(
                DESTINATION_ID,
                weak.clone(),
                Box::new(DestinationProcessor { channels }),
                frames,
            );
            let mut graph = GraphState::default();
            graph.nodes.insert(DESTINATION_ID, Arc::clone(&destination));
            ContextInner {
                graph: Mutex::new(graph),
                render: Mutex::new(RenderState::new(config.input_channels, frames)),
                destination,
                next_id: AtomicU32::new(DESTINATION_ID.0 + 1),
                current_frame: AtomicU64::new(0),
                running: AtomicBool::new(true),
                released: AtomicBool::new(false),
                finished: Mutex::new(Vec::new()),
                warned: AtomicU8::new(0),
                silent_renders: AtomicU64::new(0),
                config,
            }
        });
        inner
            .destination
            .initialize(inner.config.sample_rate, inner.config.quantum_frames);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "context_created: {} Hz, {} frames, {} out / {} in",
            inner.config.sample_rate,
            inner.config.quantum_frames,
            inner.config.output_channels,
            inner.config.input_channels
        );
        Ok(Self { inner })
    }

    /// Configuration the context was built with.
    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> f32 {
        self.inner.config.sample_rate
    }

    /// Frames rendered so far.
    pub fn current_sample_frame(&self) -> u64 {
        self.inner.current_sample_frame()
    }

    /// Seconds rendered so far.
    pub fn current_time(&self) -> f64 {
        self.inner.current_time()
    }

    /// False after [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Quanta answered with silence because of a shape mismatch, lock
    /// contention or a stopped context.
    pub fn silent_render_count(&self) -> u64 {
        self.inner.silent_renders.load(Ordering::Acquire)
    }

    /// Handle to the destination node.
    pub fn destination(&self) -> NodeRef {
        NodeRef::new(Arc::clone(&self.inner.destination))
    }

    /// Registered nodes, destination included.
    pub fn node_count(&self) -> usize {
        self.graph_lock().node_count()
    }

    /// Acquire the graph lock.
    pub fn graph_lock(&self) -> GraphLock<'_> {
        self.inner.graph_lock()
    }

    /// Acquire the render lock. Hold it briefly: the render thread answers
    /// with silence while it is taken. Never take the graph lock while
    /// holding this one; use [`lock`](Self::lock) instead.
    pub fn render_lock(&self) -> RenderLock<'_> {
        self.inner.render_lock()
    }

    /// Acquire both locks, graph first.
    pub fn lock(&self) -> (GraphLock<'_>, RenderLock<'_>) {
        let graph = self.inner.graph_lock();
        let render = self.inner.render_lock();
        (graph, render)
    }

    /// Register and initialize a node.
    pub fn create_node<P: AudioProcessor + 'static>(&self, processor: P) -> Result<NodeRef> {
        self.create_boxed(Box::new(processor))
    }

    /// Register and initialize a boxed processor.
    pub fn create_boxed(&self, processor: Box<dyn AudioProcessor>) -> Result<NodeRef> {
        if !self.is_running() {
            return Err(GraphError::ContextClosed);
        }
        // Ids are never reused, so a wrapped counter would alias the destination.
        let id = self
            .inner
            .next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
            .map(NodeId)
            .map_err(|_| GraphError::NodeIdsExhausted)?;
        let config = &self.inner.config;
        let node = AudioNode::new(
            id,
            Arc::downgrade(&self.inner),
            processor,
            config.quantum_frames,
        );
        let mut graph = self.graph_lock();
        node.initialize(config.sample_rate, config.quantum_frames);
        graph.state.nodes.insert(id, Arc::clone(&node));
        graph.topology_changed();

        #[cfg(feature = "tracing")]
        tracing::debug!("node_created: {} ({})", id, node.name());
        Ok(NodeRef::new(node))
    }

    /// Mark and sweep unreferenced nodes, then publish pending topology to
    /// the render side. Takes both locks.
    pub fn collect_garbage(&self) {
        let (mut graph, mut render) = self.lock();
        self.inner.handle_post_render_tasks(&mut graph, &mut render);
    }

    /// Halt rendering and tear the graph down.
    ///
    /// Every node except the destination is disconnected, uninitialized and
    /// dropped from the registry. Later `render` calls produce silence and
    /// `create_node` fails with [`GraphError::ContextClosed`].
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let (mut graph, mut render) = self.lock();
        let nodes: Vec<Arc<AudioNode>> = graph
            .state
            .nodes
            .values()
            .filter(|node| node.kind() != NodeKind::Destination)
            .cloned()
            .collect();
        for node in &nodes {
            node.disconnect_all(&mut graph);
        }
        for node in &nodes {
            node.uninitialize();
            graph.state.nodes.remove(&node.id());
        }
        graph.state.marked.clear();
        graph.state.automatic_pull.clear();
        graph.state.automatic_pull_dirty = false;
        render.state.automatic_pull.clear();
        self.inner.handle_dirty_inputs(&mut graph, &render);

        #[cfg(feature = "tracing")]
        tracing::debug!("context_stopped: {} nodes torn down", nodes.len());
    }

    /// Render one quantum into `destination`.
    ///
    /// `source` is the device input for this quantum, if any. Never panics
    /// on contention and never blocks for longer than the configured
    /// render-lock timeout: if the shape is wrong, the render lock is
    /// unavailable or the context is stopped, `destination` is zeroed.
    pub fn render(&self, source: Option<&AudioBus>, destination: &mut AudioBus, frames: usize) {
        let inner = &*self.inner;
        let config = &inner.config;
        if frames != config.quantum_frames
            || destination.length() != frames
            || destination.number_of_channels() != config.output_channels
        {
            inner.render_silence(destination, RenderWarning::Shape);
            return;
        }
        let Some(mut render) = inner.try_render_lock() else {
            inner.render_silence(destination, RenderWarning::Contention);
            return;
        };
        if !inner.is_running() {
            inner.render_silence(destination, RenderWarning::Stopped);
            return;
        }

        render.begin_quantum();
        if let Some(mut graph) = inner.try_graph_lock() {
            inner.handle_pre_render_tasks(&mut graph, &mut render);
        }
        render.fill_live_input(source);

        let bus = inner.destination.inputs()[0].pull(&render, None, frames);
        destination.copy_from(&bus.read());
        inner.process_automatic_pull_nodes(&render, frames);

        if let Some(mut graph) = inner.try_graph_lock() {
            inner.handle_post_render_tasks(&mut graph, &mut render);
        }
        inner
            .current_frame
            .fetch_add(frames as u64, Ordering::AcqRel);
    }
}

impl core::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AudioContext")
            .field("sample_rate", &self.inner.config.sample_rate)
            .field("quantum_frames", &self.inner.config.quantum_frames)
            .field("current_sample_frame", &self.current_sample_frame())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::ConstantSourceNode;

    fn context() -> AudioContext {
        AudioContext::new(ContextConfig {
            quantum_frames: 16,
            ..ContextConfig::default()
        })
        .expect("valid config")
    }

    #[test]
    fn exhausted_ids_never_alias_the_destination() {
        let ctx = context();
        ctx.inner.next_id.store(u32::MAX, Ordering::Release);
        let last = ctx.create_node(ConstantSourceNode::new(1.0)).expect("last id");
        assert_eq!(last.id(), NodeId(u32::MAX));

        let err = ctx.create_node(ConstantSourceNode::new(1.0)).unwrap_err();
        assert_eq!(err, GraphError::NodeIdsExhausted);
        assert_eq!(ctx.node_count(), 2);
        assert_eq!(ctx.destination().kind(), NodeKind::Destination);
    }

    #[test]
    fn new_context_has_only_destination() {
        let ctx = context();
        assert_eq!(ctx.node_count(), 1);
        let dest = ctx.destination();
        assert_eq!(dest.id(), DESTINATION_ID);
        assert_eq!(dest.kind(), NodeKind::Destination);
        assert!(dest.is_initialized());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = AudioContext::new(ContextConfig::with_sample_rate(-1.0)).unwrap_err();
        assert!(matches!(err, ConfigError::SampleRate(_)));
    }

    #[test]
    fn unconnected_destination_renders_silence() {
        let ctx = context();
        let mut out = AudioBus::new(2, 16);
        out.channel_mut(0).fill(1.0);
        ctx.render(None, &mut out, 16);
        assert_eq!(out.max_abs_value(), 0.0);
        assert_eq!(ctx.current_sample_frame(), 16);
        assert_eq!(ctx.silent_render_count(), 0);
    }

    #[test]
    fn wrong_shape_renders_silence_without_advancing() {
        let ctx = context();
        let mut out = AudioBus::new(1, 16);
        ctx.render(None, &mut out, 16);
        assert_eq!(ctx.current_sample_frame(), 0);
        assert_eq!(ctx.silent_render_count(), 1);
    }

    #[test]
    fn held_render_lock_yields_silence() {
        let ctx = context();
        let ctx2 = ctx.clone();
        let render = ctx.render_lock();
        let handle = std::thread::spawn(move || {
            let mut out = AudioBus::new(2, 16);
            out.channel_mut(0).fill(1.0);
            ctx2.render(None, &mut out, 16);
            out
        });
        let out = handle.join().expect("render thread");
        drop(render);
        assert_eq!(out.max_abs_value(), 0.0);
        assert_eq!(ctx.silent_render_count(), 1);
        assert_eq!(ctx.current_sample_frame(), 0);
    }

    #[test]
    fn stopped_context_rejects_nodes_and_renders_silence() {
        let ctx = context();
        ctx.stop();
        assert!(!ctx.is_running());
        let err = ctx
            .create_node(DestinationProcessor { channels: 1 })
            .unwrap_err();
        assert_eq!(err, GraphError::ContextClosed);
        let mut out = AudioBus::new(2, 16);
        ctx.render(None, &mut out, 16);
        assert_eq!(ctx.silent_render_count(), 1);
    }
}
