//! Nodes shipped with the engine.
//!
//! Each node is an [`AudioProcessor`](crate::AudioProcessor) handed to
//! [`AudioContext::create_node`](crate::AudioContext::create_node). Anything
//! the control thread needs after that (parameters, schedules, meters,
//! loaders) is taken from the processor before it moves into the graph.

pub mod constant;
pub mod convolver;
pub mod gain;
pub mod live_input;
pub mod oscillator;
pub mod power_monitor;

pub use constant::ConstantSourceNode;
pub use convolver::{ConvolverControl, ConvolverNode, ImpulseResponse};
pub use gain::GainNode;
pub use live_input::LiveInputNode;
pub use oscillator::{OscillatorNode, Waveform};
pub use power_monitor::{PowerMeter, PowerMonitorNode};
