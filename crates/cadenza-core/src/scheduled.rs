//! Start/stop scheduling for source nodes.
//!
//! A [`Schedule`] is shared between the control thread, which calls
//! [`start`](Schedule::start) and [`stop`](Schedule::stop), and the source
//! processor, which asks it once per quantum which frames to render through
//! [`Schedule::render_range`].
//!
//! ```text
//! Unscheduled ──start──▶ Scheduled ──(start frame reached)──▶ Playing
//!                                                               │
//!                                      (stop frame reached) ────▼
//!                                                            Finished
//! ```
//!
//! `Finished` is terminal. A finished source calls
//! [`ProcessScope::finish`], and the context disables its outputs at the
//! next quantum boundary.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::bus::AudioBus;
use crate::error::{GraphError, Result};
use crate::graph::ProcessScope;

/// Playback state of a scheduled source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    /// `start` not yet called.
    Unscheduled = 0,
    /// Started, waiting for the start frame.
    Scheduled = 1,
    /// Producing sound.
    Playing = 2,
    /// Stopped for good.
    Finished = 3,
}

impl PlaybackState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Scheduled,
            2 => Self::Playing,
            3 => Self::Finished,
            _ => Self::Unscheduled,
        }
    }
}

/// Start and stop times of a source, shared with its processor.
#[derive(Debug)]
pub struct Schedule {
    /// f64 bits, seconds. Infinity until `start` publishes a time.
    start: AtomicU64,
    /// f64 bits, seconds. Infinity means no stop scheduled.
    stop: AtomicU64,
    state: AtomicU8,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

impl Schedule {
    /// An unscheduled source.
    pub fn new() -> Self {
        Self {
            start: AtomicU64::new(f64::INFINITY.to_bits()),
            stop: AtomicU64::new(f64::INFINITY.to_bits()),
            state: AtomicU8::new(PlaybackState::Unscheduled as u8),
        }
    }

    /// Current playback state.
    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Scheduled start time in seconds, if started.
    pub fn start_time(&self) -> Option<f64> {
        let t = f64::from_bits(self.start.load(Ordering::Acquire));
        t.is_finite().then_some(t)
    }

    /// Scheduled stop time in seconds, if any.
    pub fn stop_time(&self) -> Option<f64> {
        let t = f64::from_bits(self.stop.load(Ordering::Acquire));
        t.is_finite().then_some(t)
    }

    /// Begin playback at `when` seconds of context time. Times in the past
    /// start at the next quantum.
    ///
    /// # Errors
    ///
    /// [`GraphError::InvalidState`] if `when` is negative or not finite, or
    /// the source was already started.
    pub fn start(&self, when: f64) -> Result<()> {
        if !when.is_finite() || when < 0.0 {
            return Err(GraphError::InvalidState("start time must be finite and non-negative"));
        }
        self.state
            .compare_exchange(
                PlaybackState::Unscheduled as u8,
                PlaybackState::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| GraphError::InvalidState("source already started"))?;
        // The render side treats an infinite start as "not yet", so the
        // window between the two stores renders silence.
        self.start.store(when.to_bits(), Ordering::Release);
        Ok(())
    }

    /// End playback at `when` seconds. A later call replaces the stop time;
    /// stopping a finished source does nothing.
    ///
    /// # Errors
    ///
    /// [`GraphError::InvalidState`] if `when` is negative or not finite, or
    /// the source was never started.
    pub fn stop(&self, when: f64) -> Result<()> {
        if !when.is_finite() || when < 0.0 {
            return Err(GraphError::InvalidState("stop time must be finite and non-negative"));
        }
        match self.state() {
            PlaybackState::Unscheduled => Err(GraphError::InvalidState("source not started")),
            PlaybackState::Finished => Ok(()),
            PlaybackState::Scheduled | PlaybackState::Playing => {
                self.stop.store(when.to_bits(), Ordering::Release);
                Ok(())
            }
        }
    }

    /// Frames of this quantum the source should render.
    ///
    /// Frames outside the returned range are zeroed in `bus`. When the stop
    /// frame falls inside or before this quantum the schedule moves to
    /// [`PlaybackState::Finished`] and `scope.finish()` is called.
    pub fn render_range(&self, scope: &mut ProcessScope<'_, '_>, bus: &mut AudioBus) -> Range<usize> {
        let frames = scope.frames().min(bus.length());
        let range = self.update(scope.sample_rate(), scope.current_sample_frame(), frames, bus);
        if self.state() == PlaybackState::Finished {
            scope.finish();
        }
        range
    }

    /// Scheduling arithmetic behind [`render_range`](Self::render_range).
    pub(crate) fn update(
        &self,
        sample_rate: f32,
        quantum_start: u64,
        frames: usize,
        bus: &mut AudioBus,
    ) -> Range<usize> {
        let quantum_end = quantum_start + frames as u64;
        let start_frame = time_to_frame(f64::from_bits(self.start.load(Ordering::Acquire)), sample_rate);
        let stop_frame = time_to_frame(f64::from_bits(self.stop.load(Ordering::Acquire)), sample_rate);

        if let Some(stop) = stop_frame
            && stop <= quantum_start
            && self.state() != PlaybackState::Unscheduled
        {
            self.finish();
        }

        let state = self.state();
        let Some(start) = start_frame.filter(|&s| {
            s < quantum_end && matches!(state, PlaybackState::Scheduled | PlaybackState::Playing)
        }) else {
            bus.zero();
            return 0..0;
        };

        if state == PlaybackState::Scheduled {
            self.state
                .store(PlaybackState::Playing as u8, Ordering::Release);
        }

        let offset = start.saturating_sub(quantum_start) as usize;
        let offset = offset.min(frames);
        let mut end = frames;
        if let Some(stop) = stop_frame
            && stop < quantum_end
        {
            end = (stop - quantum_start) as usize;
            self.finish();
        }
        let end = end.max(offset);

        for channel in bus.channels_mut() {
            channel[..offset].fill(0.0);
            channel[end..frames].fill(0.0);
        }
        offset..end
    }

    fn finish(&self) {
        self.state
            .store(PlaybackState::Finished as u8, Ordering::Release);
    }
}

fn time_to_frame(seconds: f64, sample_rate: f32) -> Option<u64> {
    if !seconds.is_finite() {
        return None;
    }
    Some((seconds.max(0.0) * f64::from(sample_rate)).round() as u64)
}

/// A processor driven by a [`Schedule`].
///
/// Implementors hand out their schedule so the control side can keep it
/// after the processor moves into the graph.
pub trait ScheduledSource {
    /// Schedule shared with the render side.
    fn schedule(&self) -> &Arc<Schedule>;

    /// See [`Schedule::start`].
    fn start(&self, when: f64) -> Result<()> {
        self.schedule().start(when)
    }

    /// See [`Schedule::stop`].
    fn stop(&self, when: f64) -> Result<()> {
        self.schedule().stop(when)
    }

    /// See [`Schedule::state`].
    fn playback_state(&self) -> PlaybackState {
        self.schedule().state()
    }
}
