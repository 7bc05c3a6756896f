//! Connection bookkeeping shared by node inputs.
//!
//! A [`SummingJunction`] keeps two views of the outputs feeding it:
//!
//! - the **connection set**, split into active and disabled outputs, mutated
//!   by the control thread under the graph lock;
//! - the **rendering snapshot**, the active outputs as the render thread sees
//!   them, republished only at quantum boundaries with both locks held.
//!
//! Any change to the connection set, or to the channel count of a connected
//! output, flags the junction dirty. The context refreshes dirty junctions
//! at the next boundary instead of recomputing every quantum.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;

use super::node::AudioNode;
use super::output::NodeOutput;

/// Active outputs as seen by the render thread.
pub type RenderingOutputs = Vec<Arc<NodeOutput>>;

/// Outcome of moving an output between the active and disabled sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    Moved,
    Unchanged,
    NotConnected,
}

#[derive(Default)]
struct ConnectionSet {
    active: Vec<Arc<NodeOutput>>,
    disabled: Vec<Arc<NodeOutput>>,
}

fn position(set: &[Arc<NodeOutput>], output: &Arc<NodeOutput>) -> Option<usize> {
    set.iter().position(|o| Arc::ptr_eq(o, output))
}

/// Mixing point that tracks which outputs feed an input.
pub struct SummingJunction {
    owner: Weak<AudioNode>,
    connections: Mutex<ConnectionSet>,
    rendering: ArcSwap<RenderingOutputs>,
    dirty: AtomicBool,
}

impl SummingJunction {
    pub(crate) fn new(owner: Weak<AudioNode>) -> Self {
        Self {
            owner,
            connections: Mutex::new(ConnectionSet::default()),
            rendering: ArcSwap::from_pointee(Vec::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// The node this junction belongs to.
    pub fn owner(&self) -> Option<Arc<AudioNode>> {
        self.owner.upgrade()
    }

    /// False once the owning node is marked for deletion or gone, so a node
    /// mid-teardown cannot be resurrected by new connections.
    pub fn can_update_state(&self) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|node| !node.is_marked_for_deletion())
    }

    /// Whether the output is connected, active or disabled.
    pub fn is_connected(&self, output: &Arc<NodeOutput>) -> bool {
        let set = self.connections.lock();
        position(&set.active, output).is_some() || position(&set.disabled, output).is_some()
    }

    /// Whether the output is in the active set.
    pub fn is_active(&self, output: &Arc<NodeOutput>) -> bool {
        position(&self.connections.lock().active, output).is_some()
    }

    /// Whether the output is in the disabled set.
    pub fn is_disabled(&self, output: &Arc<NodeOutput>) -> bool {
        position(&self.connections.lock().disabled, output).is_some()
    }

    /// Active plus disabled connections.
    pub fn number_of_connections(&self) -> usize {
        let set = self.connections.lock();
        set.active.len() + set.disabled.len()
    }

    /// Active connections.
    pub fn number_of_active_connections(&self) -> usize {
        self.connections.lock().active.len()
    }

    /// Connections in the current rendering snapshot.
    pub fn number_of_rendering_connections(&self) -> usize {
        self.rendering.load().len()
    }

    /// Copy of the active set.
    pub fn active_outputs(&self) -> Vec<Arc<NodeOutput>> {
        self.connections.lock().active.clone()
    }

    /// Copy of every connection, active first.
    pub fn all_outputs(&self) -> Vec<Arc<NodeOutput>> {
        let set = self.connections.lock();
        set.active.iter().chain(&set.disabled).cloned().collect()
    }

    /// Render-side snapshot. Wait-free.
    pub fn rendering_outputs(&self) -> Guard<Arc<RenderingOutputs>> {
        self.rendering.load()
    }

    /// Flag the junction for a refresh. Returns true if it was clean.
    pub(crate) fn did_update(&self) -> bool {
        !self.dirty.swap(true, Ordering::AcqRel)
    }

    /// Whether a refresh is pending.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Adds to the active set. False if already connected in either set.
    pub(crate) fn insert(&self, output: &Arc<NodeOutput>) -> bool {
        let mut set = self.connections.lock();
        if position(&set.active, output).is_some() || position(&set.disabled, output).is_some() {
            return false;
        }
        set.active.push(Arc::clone(output));
        true
    }

    /// Removes from whichever set holds it. Returns `Some(was_active)`.
    pub(crate) fn remove(&self, output: &Arc<NodeOutput>) -> Option<bool> {
        let mut set = self.connections.lock();
        if let Some(i) = position(&set.active, output) {
            set.active.remove(i);
            return Some(true);
        }
        if let Some(i) = position(&set.disabled, output) {
            set.disabled.remove(i);
            return Some(false);
        }
        None
    }

    pub(crate) fn disable(&self, output: &Arc<NodeOutput>) -> Transition {
        let mut set = self.connections.lock();
        if position(&set.disabled, output).is_some() {
            return Transition::Unchanged;
        }
        match position(&set.active, output) {
            Some(i) => {
                let moved = set.active.remove(i);
                set.disabled.push(moved);
                Transition::Moved
            }
            None => Transition::NotConnected,
        }
    }

    pub(crate) fn enable(&self, output: &Arc<NodeOutput>) -> Transition {
        let mut set = self.connections.lock();
        if position(&set.active, output).is_some() {
            return Transition::Unchanged;
        }
        match position(&set.disabled, output) {
            Some(i) => {
                let moved = set.disabled.remove(i);
                set.active.push(moved);
                Transition::Moved
            }
            None => Transition::NotConnected,
        }
    }

    /// Publish the active set to the render thread and clear the dirty flag.
    /// Returns the published outputs' maximum channel count.
    pub(crate) fn publish_rendering_state(&self) -> Option<usize> {
        let active = self.active_outputs();
        let max_channels = active.iter().map(|o| o.number_of_channels()).max();
        self.rendering.store(Arc::new(active));
        self.clear_dirty();
        max_channels
    }
}
