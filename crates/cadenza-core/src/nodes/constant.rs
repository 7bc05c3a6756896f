//! Constant source node.

use std::sync::Arc;

use crate::graph::{AudioProcessor, NodeKind, NodeLayout, ProcessScope};
use crate::param::AudioParam;
use crate::scheduled::{Schedule, ScheduledSource};

/// Scheduled mono source emitting a constant offset.
#[derive(Debug)]
pub struct ConstantSourceNode {
    offset: Arc<AudioParam>,
    schedule: Arc<Schedule>,
}

impl ConstantSourceNode {
    /// Create an unscheduled source emitting `offset`.
    pub fn new(offset: f32) -> Self {
        Self {
            offset: Arc::new(AudioParam::new("offset", offset, f32::MIN, f32::MAX)),
            schedule: Arc::new(Schedule::new()),
        }
    }

    /// The offset parameter.
    pub fn offset(&self) -> Arc<AudioParam> {
        Arc::clone(&self.offset)
    }
}

impl ScheduledSource for ConstantSourceNode {
    fn schedule(&self) -> &Arc<Schedule> {
        &self.schedule
    }
}

impl AudioProcessor for ConstantSourceNode {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn layout(&self) -> NodeLayout {
        NodeLayout::source(1)
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Source
    }

    fn process(&mut self, scope: &mut ProcessScope<'_, '_>) {
        let output = scope.output(0);
        let mut bus = output.write();
        let range = self.schedule.render_range(scope, &mut bus);
        let value = self.offset.value();
        for channel in bus.channels_mut() {
            channel[range.clone()].fill(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduled::PlaybackState;
    use crate::{AudioBus, AudioContext, ContextConfig};

    #[test]
    fn unscheduled_source_is_silent() {
        let ctx = AudioContext::new(ContextConfig {
            quantum_frames: 8,
            output_channels: 1,
            ..ContextConfig::default()
        })
        .expect("context");
        let constant = ConstantSourceNode::new(1.0);
        let schedule = Arc::clone(constant.schedule());
        let node = ctx.create_node(constant).expect("node");
        ctx.graph_lock()
            .connect(&node, 0, &ctx.destination(), 0)
            .expect("connect");

        let mut out = AudioBus::new(1, 8);
        ctx.render(None, &mut out, 8);
        assert_eq!(out.max_abs_value(), 0.0);

        schedule.start(0.0).expect("start");
        ctx.render(None, &mut out, 8);
        assert!(out.channel(0).iter().all(|&s| s == 1.0));
        assert_eq!(schedule.state(), PlaybackState::Playing);
    }
}
