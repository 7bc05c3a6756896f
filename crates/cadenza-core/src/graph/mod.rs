//! Pull-based audio graph.
//!
//! The graph is a set of [`AudioNode`]s joined output-to-input. Any output
//! may feed many inputs (fan-out) and any input may mix many outputs (fan-in).
//! Rendering starts at the destination and pulls upstream; every node
//! renders at most once per quantum however many paths reach it.
//!
//! # Architecture
//!
//! - [`SummingJunction`]: the connection set of an input, split into active
//!   and disabled outputs, plus the render-side snapshot of the active ones.
//! - [`NodeInput`]: a junction with a summing bus and the pull algorithm.
//! - [`NodeOutput`]: the bus a node renders into and the inputs it feeds.
//! - [`AudioNode`]: lifecycle, memoized processing and silence propagation
//!   around an [`AudioProcessor`].
//! - [`NodeRef`]: the counted control-side handle.
//!
//! # Threading
//!
//! Topology is changed by the control thread under the
//! [`GraphLock`](crate::GraphLock). Rendering reads topology under the
//! [`RenderLock`](crate::RenderLock) through snapshots republished at
//! quantum boundaries, so a connection made mid-quantum is heard from the
//! next boundary on.
//!
//! # Example
//!
//! ```rust,ignore
//! use cadenza_core::{AudioContext, ContextConfig, ScheduledSource};
//! use cadenza_core::nodes::{ConstantSourceNode, GainNode};
//!
//! let ctx = AudioContext::new(ContextConfig::default())?;
//! let constant = ConstantSourceNode::new(1.0);
//! constant.start(0.0)?;
//! let source = ctx.create_node(constant)?;
//! let gain = ctx.create_node(GainNode::new(2.0))?;
//! {
//!     let mut g = ctx.graph_lock();
//!     g.connect(&source, 0, &gain, 0)?;
//!     g.connect(&gain, 0, &ctx.destination(), 0)?;
//! }
//! ```

pub mod input;
pub mod junction;
pub mod node;
pub mod output;
pub mod processor;

pub use input::NodeInput;
pub use junction::{RenderingOutputs, SummingJunction};
pub use node::{AudioNode, Lifecycle, NodeId, NodeRef};
pub use output::NodeOutput;
pub use processor::{AudioProcessor, ChannelDemand, NodeKind, NodeLayout, OutputChannels, ProcessScope};
