//! Periodic waveform source.

use std::f32::consts::TAU;
use std::sync::Arc;

use crate::graph::{AudioProcessor, NodeKind, NodeLayout, ProcessScope};
use crate::param::AudioParam;
use crate::scheduled::{Schedule, ScheduledSource};

/// Oscillator waveform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Waveform {
    /// Sine wave.
    #[default]
    Sine,
    /// Square wave, ±1.
    Square,
    /// Rising sawtooth, -1 to 1.
    Sawtooth,
    /// Triangle, peaking at phase 0.
    Triangle,
}

impl Waveform {
    /// Sample at `phase` in `[0, 1)`.
    #[inline]
    pub fn sample(self, phase: f32) -> f32 {
        match self {
            Waveform::Sine => (phase * TAU).sin(),
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Sawtooth => 2.0 * phase - 1.0,
            Waveform::Triangle => 4.0 * (phase - 0.5).abs() - 1.0,
        }
    }
}

/// Scheduled mono oscillator with a shared frequency parameter.
#[derive(Debug)]
pub struct OscillatorNode {
    waveform: Waveform,
    frequency: Arc<AudioParam>,
    schedule: Arc<Schedule>,
    phase: f32,
    sample_rate: f32,
}

impl OscillatorNode {
    /// Create an unscheduled oscillator.
    pub fn new(waveform: Waveform, frequency: f32) -> Self {
        Self {
            waveform,
            frequency: Arc::new(AudioParam::new("frequency", frequency, 0.0, 20_000.0)),
            schedule: Arc::new(Schedule::new()),
            phase: 0.0,
            sample_rate: 44100.0,
        }
    }

    /// Waveform.
    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    /// The frequency parameter, in Hz.
    pub fn frequency(&self) -> Arc<AudioParam> {
        Arc::clone(&self.frequency)
    }
}

impl ScheduledSource for OscillatorNode {
    fn schedule(&self) -> &Arc<Schedule> {
        &self.schedule
    }
}

impl AudioProcessor for OscillatorNode {
    fn name(&self) -> &'static str {
        "oscillator"
    }

    fn layout(&self) -> NodeLayout {
        NodeLayout::source(1)
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Source
    }

    fn initialize(&mut self, sample_rate: f32, _quantum_frames: usize) {
        self.sample_rate = sample_rate;
        self.phase = 0.0;
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }

    fn process(&mut self, scope: &mut ProcessScope<'_, '_>) {
        let output = scope.output(0);
        let mut bus = output.write();
        let range = self.schedule.render_range(scope, &mut bus);
        let nyquist = self.sample_rate * 0.5;
        let increment = self.frequency.value().min(nyquist) / self.sample_rate;

        let channel = bus.channel_mut(0);
        for sample in &mut channel[range] {
            *sample = self.waveform.sample(self.phase);
            self.phase += increment;
            if self.phase >= 1.0 {
                self.phase -= 1.0;
            }
        }
    }
}
