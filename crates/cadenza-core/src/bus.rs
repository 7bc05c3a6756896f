//! Multichannel sample buffers.
//!
//! An [`AudioBus`] is fixed at construction to a channel count and a frame
//! count. Node outputs and input summing buses are shared between the graph
//! objects that own them and the render pass as a [`SharedBus`]; the shared
//! cell stays the same while its contents are replaced at quantum boundaries
//! when a channel count changes, so identity checks with [`Arc::ptr_eq`]
//! stay meaningful across reallocations.
//!
//! # Mixing policy
//!
//! [`AudioBus::sum_from`] accepts any source channel count and maps it onto
//! the destination with one total rule:
//!
//! | source | destination | mapping |
//! |--------|-------------|---------|
//! | S      | S           | channel-wise |
//! | 1      | D > 1       | mono added to every channel |
//! | S > 1  | 1           | average of all source channels |
//! | S      | D, other    | channel `i` → `i` for `i < min(S, D)`, rest dropped |

use std::sync::Arc;

use parking_lot::RwLock;

/// A bus shared between its owner and the render pass.
pub type SharedBus = Arc<RwLock<AudioBus>>;

/// Wrap a bus for sharing.
pub fn shared(bus: AudioBus) -> SharedBus {
    Arc::new(RwLock::new(bus))
}

/// Fixed-shape multichannel buffer with a silence hint.
///
/// The silence flag is advisory. Consumers may skip work on a silent bus,
/// but nothing depends on it being accurate: a bus flagged non-silent may
/// still hold zeros. Any mutable access to the samples clears the flag, so
/// it can only ever be wrong in that direction.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBus {
    channels: Vec<Vec<f32>>,
    frames: usize,
    silent: bool,
}

impl AudioBus {
    /// Creates a zeroed, silent bus.
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            channels: (0..channels).map(|_| vec![0.0; frames]).collect(),
            frames,
            silent: true,
        }
    }

    /// Number of channels.
    #[inline]
    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Number of frames per channel.
    #[inline]
    pub fn length(&self) -> usize {
        self.frames
    }

    /// Samples of one channel.
    #[inline]
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    /// Mutable samples of one channel. Clears the silence flag, since the
    /// caller may write anything.
    #[inline]
    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        self.silent = false;
        &mut self.channels[index]
    }

    /// Iterates over all channels.
    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        self.channels.iter().map(Vec::as_slice)
    }

    /// Iterates mutably over all channels. Clears the silence flag.
    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        self.silent = false;
        self.channels.iter_mut().map(Vec::as_mut_slice)
    }

    /// Whether the bus is flagged silent.
    #[inline]
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Sets the silence hint.
    #[inline]
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Zeros every channel and flags the bus silent.
    pub fn zero(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
        self.silent = true;
    }

    /// Whether `other` has the same channel and frame count.
    pub fn same_shape(&self, other: &AudioBus) -> bool {
        self.number_of_channels() == other.number_of_channels() && self.frames == other.frames
    }

    /// Copies samples and the silence flag from a bus of identical shape.
    ///
    /// # Panics
    ///
    /// Panics if the channel or frame counts differ. A mismatch here means an
    /// engine invariant broke, not bad user input.
    pub fn copy_from(&mut self, other: &AudioBus) {
        assert!(
            self.same_shape(other),
            "bus shape mismatch: {}x{} <- {}x{}",
            self.number_of_channels(),
            self.frames,
            other.number_of_channels(),
            other.frames
        );
        for (dst, src) in self.channels.iter_mut().zip(&other.channels) {
            dst.copy_from_slice(src);
        }
        self.silent = other.silent;
    }

    /// Adds `other` into this bus using the module's mixing policy.
    ///
    /// Silent sources are skipped. Adding any non-silent source clears the
    /// silence flag.
    ///
    /// # Panics
    ///
    /// Panics if the frame counts differ.
    pub fn sum_from(&mut self, other: &AudioBus) {
        assert_eq!(
            self.frames, other.frames,
            "bus length mismatch: {} <- {}",
            self.frames, other.frames
        );
        if other.silent {
            return;
        }
        let src_channels = other.number_of_channels();
        let dst_channels = self.number_of_channels();
        if src_channels == 0 || dst_channels == 0 {
            return;
        }

        if src_channels == dst_channels {
            for (dst, src) in self.channels.iter_mut().zip(&other.channels) {
                accumulate(dst, src, 1.0);
            }
        } else if src_channels == 1 {
            for dst in &mut self.channels {
                accumulate(dst, &other.channels[0], 1.0);
            }
        } else if dst_channels == 1 {
            let scale = 1.0 / src_channels as f32;
            for src in &other.channels {
                accumulate(&mut self.channels[0], src, scale);
            }
        } else {
            for (dst, src) in self.channels.iter_mut().zip(&other.channels) {
                accumulate(dst, src, 1.0);
            }
        }
        self.silent = false;
    }

    /// Replaces the contents with `other`, mixed to this bus's channel
    /// count when the shapes differ.
    ///
    /// # Panics
    ///
    /// Panics if the frame counts differ.
    pub fn mix_from(&mut self, other: &AudioBus) {
        if self.same_shape(other) {
            self.copy_from(other);
        } else {
            self.zero();
            self.sum_from(other);
        }
    }

    /// Multiplies every sample by `gain`.
    pub fn scale(&mut self, gain: f32) {
        for channel in &mut self.channels {
            for sample in channel.iter_mut() {
                *sample *= gain;
            }
        }
    }

    /// Largest absolute sample value across all channels.
    pub fn max_abs_value(&self) -> f32 {
        self.channels
            .iter()
            .flat_map(|c| c.iter())
            .fold(0.0_f32, |acc, s| acc.max(s.abs()))
    }
}

#[inline]
fn accumulate(dst: &mut [f32], src: &[f32], scale: f32) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += *s * scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(channels: usize, frames: usize, values: &[f32]) -> AudioBus {
        let mut bus = AudioBus::new(channels, frames);
        for (i, ch) in bus.channels_mut().enumerate() {
            ch.fill(values[i]);
        }
        bus.set_silent(false);
        bus
    }

    #[test]
    fn new_bus_is_zeroed_and_silent() {
        let bus = AudioBus::new(2, 16);
        assert!(bus.is_silent());
        assert_eq!(bus.number_of_channels(), 2);
        assert_eq!(bus.length(), 16);
        assert_eq!(bus.max_abs_value(), 0.0);
    }

    #[test]
    fn written_bus_is_summed_without_clearing_the_flag_by_hand() {
        let mut mono = AudioBus::new(1, 4);
        mono.channel_mut(0).fill(0.5);
        assert!(!mono.is_silent());

        let mut stereo = AudioBus::new(2, 4);
        stereo.sum_from(&mono);
        assert!(stereo.channels().all(|ch| ch.iter().all(|&s| s == 0.5)));

        let mut wide = AudioBus::new(2, 4);
        for ch in wide.channels_mut() {
            ch.fill(0.25);
        }
        let mut down = AudioBus::new(1, 4);
        down.sum_from(&wide);
        assert!(down.channel(0).iter().all(|&s| s == 0.25));
    }

    #[test]
    fn zero_clears_and_flags_silent() {
        let mut bus = filled(2, 8, &[0.5, -0.5]);
        bus.zero();
        assert!(bus.is_silent());
        assert_eq!(bus.max_abs_value(), 0.0);
    }

    #[test]
    fn copy_from_copies_flag() {
        let src = filled(2, 8, &[0.25, 0.75]);
        let mut dst = AudioBus::new(2, 8);
        dst.copy_from(&src);
        assert!(!dst.is_silent());
        assert_eq!(dst, src);
    }

    #[test]
    #[should_panic(expected = "bus shape mismatch")]
    fn copy_from_rejects_channel_mismatch() {
        let src = AudioBus::new(1, 8);
        let mut dst = AudioBus::new(2, 8);
        dst.copy_from(&src);
    }

    #[test]
    #[should_panic(expected = "bus shape mismatch")]
    fn copy_from_rejects_length_mismatch() {
        let src = AudioBus::new(2, 4);
        let mut dst = AudioBus::new(2, 8);
        dst.copy_from(&src);
    }

    #[test]
    fn mono_up_mixes_to_every_channel() {
        let src = filled(1, 4, &[0.5]);
        let mut dst = AudioBus::new(6, 4);
        dst.sum_from(&src);
        for ch in dst.channels() {
            assert!(ch.iter().all(|&s| s == 0.5));
        }
        assert!(!dst.is_silent());
    }

    #[test]
    fn down_mix_to_mono_averages() {
        let src = filled(2, 4, &[1.0, 0.0]);
        let mut dst = AudioBus::new(1, 4);
        dst.sum_from(&src);
        assert!(dst.channel(0).iter().all(|&s| s == 0.5));
    }

    #[test]
    fn discrete_mapping_drops_extra_channels() {
        let src = filled(3, 4, &[1.0, 2.0, 3.0]);
        let mut dst = AudioBus::new(2, 4);
        dst.sum_from(&src);
        assert!(dst.channel(0).iter().all(|&s| s == 1.0));
        assert!(dst.channel(1).iter().all(|&s| s == 2.0));

        let src = filled(2, 4, &[1.0, 2.0]);
        let mut dst = AudioBus::new(4, 4);
        dst.sum_from(&src);
        assert!(dst.channel(2).iter().all(|&s| s == 0.0));
        assert!(dst.channel(3).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn silent_source_is_skipped() {
        let mut src = filled(1, 4, &[9.0]);
        src.set_silent(true);
        let mut dst = AudioBus::new(2, 4);
        dst.sum_from(&src);
        assert!(dst.is_silent());
        assert_eq!(dst.max_abs_value(), 0.0);
    }

    #[test]
    fn mix_from_replaces_previous_contents() {
        let mut dst = filled(2, 4, &[7.0, 7.0]);
        dst.mix_from(&filled(1, 4, &[0.5]));
        assert!(dst.channels().all(|ch| ch.iter().all(|&s| s == 0.5)));

        dst.mix_from(&filled(2, 4, &[1.0, 2.0]));
        assert!(dst.channel(1).iter().all(|&s| s == 2.0));
    }

    #[test]
    fn scale_multiplies() {
        let mut bus = filled(2, 4, &[0.5, -1.0]);
        bus.scale(2.0);
        assert!(bus.channel(0).iter().all(|&s| s == 1.0));
        assert!(bus.channel(1).iter().all(|&s| s == -2.0));
    }
}
