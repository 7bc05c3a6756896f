//! Single-writer, single-reader handoff of prepared resources.
//!
//! The control thread (or a loader worker) builds a resource off the render
//! thread and [`stage`](Staged::stage)s it. The render thread calls
//! [`take`](Staged::take) at the top of `process`: one atomic swap, no lock,
//! no allocation. A value staged twice before the render thread looks is
//! replaced; only the newest is delivered.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Pending-slot cell for handing a resource to the render thread.
#[derive(Debug, Default)]
pub struct Staged<T> {
    pending: ArcSwapOption<T>,
}

impl<T> Staged<T> {
    /// An empty slot.
    pub fn new() -> Self {
        Self {
            pending: ArcSwapOption::empty(),
        }
    }

    /// Stage a new value, replacing any value not yet taken.
    pub fn stage(&self, value: T) {
        self.stage_arc(Arc::new(value));
    }

    /// Stage an already shared value.
    pub fn stage_arc(&self, value: Arc<T>) {
        self.pending.store(Some(value));
    }

    /// Take the pending value, leaving the slot empty. Wait-free.
    pub fn take(&self) -> Option<Arc<T>> {
        self.pending.swap(None)
    }

    /// Whether a value is waiting.
    pub fn is_pending(&self) -> bool {
        self.pending.load().is_some()
    }

    /// Replace `working` with the pending value, if any. Returns true on swap.
    pub fn swap_into(&self, working: &mut Option<Arc<T>>) -> bool {
        match self.take() {
            Some(next) => {
                *working = Some(next);
                true
            }
            None => false,
        }
    }
}
