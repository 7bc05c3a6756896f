//! Error types for graph mutation, configuration and resource loading.
//!
//! Only control-thread operations return these. The render path never
//! produces an error value: it degrades to silence instead.

use thiserror::Error;

use crate::graph::NodeId;

/// Errors surfaced to the control thread by the graph-mutation API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The node is not registered with this context (already swept or never created).
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// An input index past the node's input count.
    #[error("node {node} has no input {index}")]
    InputOutOfRange {
        /// Node addressed.
        node: NodeId,
        /// Requested input index.
        index: usize,
    },

    /// An output index past the node's output count.
    #[error("node {node} has no output {index}")]
    OutputOutOfRange {
        /// Node addressed.
        node: NodeId,
        /// Requested output index.
        index: usize,
    },

    /// The output already feeds this input, either active or disabled.
    #[error("output is already connected to this input")]
    AlreadyConnected,

    /// The output does not feed this input.
    #[error("output is not connected to this input")]
    NotConnected,

    /// The connection would close a feedback loop.
    #[error("connection would create a cycle")]
    CycleDetected,

    /// The node is being torn down and refuses further state updates.
    #[error("node {0} is marked for deletion")]
    MarkedForDeletion(NodeId),

    /// The nodes belong to different contexts.
    #[error("nodes belong to different contexts")]
    ContextMismatch,

    /// The input or output outlived its node.
    #[error("endpoint no longer belongs to a node")]
    Detached,

    /// A scheduling call arrived in the wrong playback state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The context has been stopped.
    #[error("context is closed")]
    ContextClosed,

    /// Every node id has been handed out.
    #[error("node ids exhausted")]
    NodeIdsExhausted,
}

/// Configuration validation and parsing errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Sample rate must be finite and positive.
    #[error("invalid sample rate: {0}")]
    SampleRate(f32),

    /// Quantum size outside `1..=MAX_QUANTUM_FRAMES`.
    #[error("invalid quantum size: {0} frames")]
    QuantumFrames(usize),

    /// Channel count outside the supported range.
    #[error("invalid {which} channel count: {count}")]
    Channels {
        /// `"output"` or `"input"`.
        which: &'static str,
        /// Offending value.
        count: usize,
    },

    /// Failed to parse TOML
    #[cfg(feature = "serde")]
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// A resource loader failed to produce its resource.
///
/// Cloneable so every observer of a shared loader can read the same failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The construction closure reported a failure.
    #[error("failed to load '{name}': {reason}")]
    Failed {
        /// Loader name.
        name: String,
        /// Description of the failure.
        reason: String,
    },

    /// The worker thread panicked or could not be spawned.
    #[error("loader '{0}' worker thread did not complete")]
    WorkerLost(String),
}

impl LoadError {
    /// Create a failure for the named loader.
    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        LoadError::Failed {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for graph mutations.
pub type Result<T> = std::result::Result<T, GraphError>;
