//! Property-based tests for bus summation and the channel mixing policy.
//!
//! Covers every source/destination channel-count pair the engine accepts,
//! using proptest for randomized sample data.

use cadenza_core::{AudioBus, MAX_CHANNELS};
use proptest::prelude::*;

const FRAMES: usize = 16;

fn bus_from(samples: &[Vec<f32>]) -> AudioBus {
    let mut bus = AudioBus::new(samples.len(), FRAMES);
    for (channel, data) in bus.channels_mut().zip(samples) {
        channel.copy_from_slice(data);
    }
    bus.set_silent(false);
    bus
}

fn channels_strategy(max: usize) -> impl Strategy<Value = Vec<Vec<f32>>> {
    prop::collection::vec(
        prop::collection::vec(-1.0f32..=1.0f32, FRAMES),
        1..=max,
    )
}

/// Expected value of destination channel `d` at frame `n` after summing
/// `src` into a zeroed bus with `dst_channels` channels.
fn expected(src: &[Vec<f32>], dst_channels: usize, d: usize, n: usize) -> f32 {
    let s = src.len();
    if s == dst_channels {
        src[d][n]
    } else if s == 1 {
        src[0][n]
    } else if dst_channels == 1 {
        src.iter().map(|c| c[n]).sum::<f32>() / s as f32
    } else if d < s {
        src[d][n]
    } else {
        0.0
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Summing into a zeroed bus follows the mixing table for every
    /// channel-count pair.
    #[test]
    fn sum_into_zero_matches_policy(
        src in channels_strategy(8),
        dst_channels in 1usize..=8,
    ) {
        let source = bus_from(&src);
        let mut dest = AudioBus::new(dst_channels, FRAMES);
        dest.sum_from(&source);

        prop_assert!(!dest.is_silent());
        for d in 0..dst_channels {
            for n in 0..FRAMES {
                let want = expected(&src, dst_channels, d, n);
                let got = dest.channel(d)[n];
                prop_assert!(
                    (got - want).abs() < 1e-5,
                    "{}→{} ch{} frame{}: got {}, want {}",
                    src.len(), dst_channels, d, n, got, want
                );
            }
        }
    }

    /// Summing is additive: two sums equal the sum of the individual mixes.
    #[test]
    fn summation_is_additive(
        a in channels_strategy(4),
        b in channels_strategy(4),
        dst_channels in 1usize..=4,
    ) {
        let mut both = AudioBus::new(dst_channels, FRAMES);
        both.sum_from(&bus_from(&a));
        both.sum_from(&bus_from(&b));

        let mut only_a = AudioBus::new(dst_channels, FRAMES);
        only_a.sum_from(&bus_from(&a));
        let mut only_b = AudioBus::new(dst_channels, FRAMES);
        only_b.sum_from(&bus_from(&b));

        for d in 0..dst_channels {
            for n in 0..FRAMES {
                let want = only_a.channel(d)[n] + only_b.channel(d)[n];
                prop_assert!((both.channel(d)[n] - want).abs() < 1e-5);
            }
        }
    }

    /// A silent source never changes the destination, whatever its samples.
    #[test]
    fn silent_source_is_ignored(
        src in channels_strategy(4),
        dst_channels in 1usize..=4,
    ) {
        let mut source = bus_from(&src);
        source.set_silent(true);
        let mut dest = AudioBus::new(dst_channels, FRAMES);
        dest.sum_from(&source);
        prop_assert!(dest.is_silent());
        prop_assert_eq!(dest.max_abs_value(), 0.0);
    }

    /// Mixing into a single bus never raises the peak above the source's.
    #[test]
    fn mix_from_does_not_amplify(
        src in channels_strategy(8),
        dst_channels in 1usize..=MAX_CHANNELS,
    ) {
        let source = bus_from(&src);
        let mut dest = AudioBus::new(dst_channels, FRAMES);
        dest.mix_from(&source);
        prop_assert!(dest.max_abs_value() <= source.max_abs_value() + 1e-6);
    }
}
