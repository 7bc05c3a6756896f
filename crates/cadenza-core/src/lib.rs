//! Cadenza Core - pull-based real-time audio graph engine
//!
//! This crate provides the graph machinery a real-time audio renderer sits on:
//! multi-channel buses, summing junctions, node inputs and outputs with a
//! memoized pull algorithm, a two-lock concurrency protocol and deferred
//! node teardown.
//!
//! # Core Abstractions
//!
//! ## Buses
//!
//! - [`AudioBus`] - Fixed-length multi-channel sample buffer with a silence flag
//! - [`SharedBus`] - Stable shared cell holding a bus, identity preserved across reallocation
//!
//! ## Graph
//!
//! - [`AudioNode`] - Lifecycle, memoized processing and silence propagation
//! - [`NodeInput`] / [`NodeOutput`] - Connection endpoints and the pull algorithm
//! - [`SummingJunction`] - Active and disabled connection sets with a render snapshot
//! - [`AudioProcessor`] - The per-node DSP contract
//! - [`NodeRef`] - Counted control-side handle
//!
//! ## Context
//!
//! - [`AudioContext`] - Node registry and render driver
//! - [`GraphLock`] / [`RenderLock`] - Scoped proofs of lock ownership
//!
//! ## Resource Handoff
//!
//! - [`Staged`] - Wait-free pending slot consumed at the top of `process`
//! - [`AsyncLoader`] - Worker-thread construction, with process-wide sharing
//!
//! ## Nodes
//!
//! - [`nodes`] - Gain, constant source, oscillator, live input, power monitor, convolver
//!
//! # Example
//!
//! ```rust,ignore
//! use cadenza_core::{AudioBus, AudioContext, ContextConfig, ScheduledSource};
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
//!
//! // From the audio callback:
//! let mut out = AudioBus::new(2, 128);
//! ctx.render(None, &mut out, 128);
//! assert_eq!(out.channel(0)[0], 2.0);
//! ```
//!
//! # Design Principles
//!
//! - **Render thread never blocks**: only `try_lock` on shared state, silence on contention
//! - **Deferred deletion**: nodes are marked on the control thread and swept at quantum boundaries
//! - **Snapshot topology**: connection changes reach the renderer at the next boundary

pub mod bus;
pub mod config;
mod context;
pub mod error;
pub mod graph;
pub mod loader;
mod lock;
pub mod nodes;
pub mod param;
pub mod scheduled;
pub mod staged;

// Re-export main types at crate root
pub use bus::{AudioBus, SharedBus};
pub use config::{ContextConfig, DEFAULT_QUANTUM_FRAMES, MAX_CHANNELS, MAX_QUANTUM_FRAMES};
pub use context::AudioContext;
pub use error::{ConfigError, GraphError, LoadError, Result};
pub use graph::{
    AudioNode, AudioProcessor, ChannelDemand, Lifecycle, NodeId, NodeInput, NodeKind, NodeLayout,
    NodeOutput, NodeRef, OutputChannels, ProcessScope, SummingJunction,
};
pub use loader::AsyncLoader;
pub use lock::{GraphLock, RenderLock};
pub use param::AudioParam;
pub use scheduled::{PlaybackState, Schedule, ScheduledSource};
pub use staged::Staged;
