//! Convolution with a loaded impulse response.
//!
//! Impulse responses are built off the render thread, usually by an
//! [`AsyncLoader`], and reach the processor through a [`Staged`] slot taken
//! at the top of `process`. Until a response arrives the node passes its
//! input through unchanged.
//!
//! # Algorithm
//!
//! Uniformly partitioned convolution with partitions of
//! [`PARTITION_FRAMES`]. The first partition is applied directly in the
//! time domain, sample by sample. Every later partition is applied by
//! overlap-save in the frequency domain: when a block of input completes,
//! its spectrum joins a delay line of past spectra and the output of the
//! *next* block is computed from it. Later partitions are delayed by at
//! least one block anyway, so the node adds no latency whatever the
//! quantum size.
//!
//! Partition spectra and FFT plans are computed when the
//! [`ImpulseResponse`] is built. The render thread only runs one forward
//! and one inverse FFT per channel per completed block.
//!
//! Channel `c` is convolved with response channel `c`, or with the last
//! response channel when the response has fewer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::error::LoadError;
use crate::graph::{AudioProcessor, NodeLayout, ProcessScope};
use crate::loader::AsyncLoader;
use crate::staged::Staged;

/// Frames per partition.
pub const PARTITION_FRAMES: usize = 128;
/// Overlap-save transform size.
const FFT_SIZE: usize = 2 * PARTITION_FRAMES;

/// Level matching applied on top of RMS normalization.
const GAIN_CALIBRATION: f32 = 0.00125;
/// Sample rate the calibration was measured at.
const GAIN_CALIBRATION_SAMPLE_RATE: f32 = 44100.0;
/// RMS floor for normalization.
const MIN_POWER: f32 = 0.000125;

/// One response channel split into partitions.
#[derive(Clone)]
struct Kernel {
    /// First partition, time domain.
    head: Vec<f32>,
    /// Spectra of the remaining partitions, scaled for the inverse FFT.
    tail: Vec<Vec<Complex<f32>>>,
}

/// An immutable, validated impulse response, partitioned for convolution.
#[derive(Clone)]
pub struct ImpulseResponse {
    channels: Vec<Vec<f32>>,
    sample_rate: f32,
    normalization_scale: f32,
    kernels: Vec<Kernel>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl ImpulseResponse {
    /// Validate response samples and prepare their partitions.
    ///
    /// # Errors
    ///
    /// [`LoadError::Failed`] if there are no channels, the channels are
    /// empty or of different lengths, or the sample rate is not positive.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: f32) -> Result<Self, LoadError> {
        let Some(first) = channels.first() else {
            return Err(LoadError::failed("impulse response", "no channels"));
        };
        let length = first.len();
        if length == 0 {
            return Err(LoadError::failed("impulse response", "empty response"));
        }
        if channels.iter().any(|c| c.len() != length) {
            return Err(LoadError::failed("impulse response", "channel lengths differ"));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(LoadError::failed("impulse response", "invalid sample rate"));
        }

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(FFT_SIZE);
        let inverse = planner.plan_fft_inverse(FFT_SIZE);
        let kernels = channels
            .iter()
            .map(|samples| partition(samples, forward.as_ref()))
            .collect();
        let normalization_scale = normalization_scale(&channels, sample_rate);
        Ok(Self {
            channels,
            sample_rate,
            normalization_scale,
            kernels,
            forward,
            inverse,
        })
    }

    /// Number of channels.
    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Frames per channel.
    pub fn length(&self) -> usize {
        self.channels[0].len()
    }

    /// Sample rate the response was recorded at.
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.length() as f64 / f64::from(self.sample_rate)
    }

    /// Samples of channel `index`, clamped to the last channel.
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index.min(self.channels.len() - 1)]
    }

    /// Number of partitions per channel.
    pub fn number_of_partitions(&self) -> usize {
        1 + self.kernels[0].tail.len()
    }

    /// Gain that brings the response to a calibrated RMS level.
    pub fn normalization_scale(&self) -> f32 {
        self.normalization_scale
    }

    fn kernel(&self, index: usize) -> &Kernel {
        &self.kernels[index.min(self.kernels.len() - 1)]
    }

    fn scratch_len(&self) -> usize {
        self.forward
            .get_inplace_scratch_len()
            .max(self.inverse.get_inplace_scratch_len())
    }
}

impl core::fmt::Debug for ImpulseResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ImpulseResponse")
            .field("channels", &self.number_of_channels())
            .field("length", &self.length())
            .field("sample_rate", &self.sample_rate)
            .field("partitions", &self.number_of_partitions())
            .finish_non_exhaustive()
    }
}

fn partition(samples: &[f32], forward: &dyn Fft<f32>) -> Kernel {
    let head = samples[..samples.len().min(PARTITION_FRAMES)].to_vec();
    let scale = 1.0 / FFT_SIZE as f32;
    let tail = samples
        .get(PARTITION_FRAMES..)
        .unwrap_or(&[])
        .chunks(PARTITION_FRAMES)
        .map(|chunk| {
            let mut spectrum = vec![Complex::new(0.0, 0.0); FFT_SIZE];
            for (bin, &s) in spectrum.iter_mut().zip(chunk) {
                *bin = Complex::new(s * scale, 0.0);
            }
            forward.process(&mut spectrum);
            spectrum
        })
        .collect();
    Kernel { head, tail }
}

fn normalization_scale(channels: &[Vec<f32>], sample_rate: f32) -> f32 {
    let samples: usize = channels.iter().map(Vec::len).sum();
    let power: f32 = channels.iter().flatten().map(|s| s * s).sum();
    let rms = (power / samples as f32).sqrt();
    let rms = if rms.is_finite() { rms.max(MIN_POWER) } else { MIN_POWER };
    GAIN_CALIBRATION / rms * (GAIN_CALIBRATION_SAMPLE_RATE / sample_rate)
}

/// Convolution state of one channel.
struct Lane {
    /// Previous block followed by the block being filled.
    input: Vec<f32>,
    fill: usize,
    /// Ring of past input spectra, one per tail partition.
    spectra: Vec<Vec<Complex<f32>>>,
    newest: usize,
    /// Tail contribution for the block being filled.
    tail_out: Vec<f32>,
    accum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl Lane {
    fn new(response: &ImpulseResponse) -> Self {
        let partitions = response.number_of_partitions() - 1;
        Self {
            input: vec![0.0; FFT_SIZE],
            fill: 0,
            spectra: vec![vec![Complex::new(0.0, 0.0); FFT_SIZE]; partitions],
            newest: 0,
            tail_out: vec![0.0; PARTITION_FRAMES],
            accum: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            scratch: vec![Complex::new(0.0, 0.0); response.scratch_len()],
        }
    }

    fn clear(&mut self) {
        self.input.fill(0.0);
        self.fill = 0;
        for spectrum in &mut self.spectra {
            spectrum.fill(Complex::new(0.0, 0.0));
        }
        self.tail_out.fill(0.0);
    }

    /// Convolve `samples` in place.
    fn process(&mut self, response: &ImpulseResponse, kernel: &Kernel, samples: &mut [f32], gain: f32) {
        for sample in samples {
            let now = PARTITION_FRAMES + self.fill;
            self.input[now] = *sample;
            let head: f32 = kernel
                .head
                .iter()
                .enumerate()
                .map(|(t, h)| h * self.input[now - t])
                .sum();
            *sample = gain * (head + self.tail_out[self.fill]);
            self.fill += 1;
            if self.fill == PARTITION_FRAMES {
                self.finish_block(response, kernel);
            }
        }
    }

    fn finish_block(&mut self, response: &ImpulseResponse, kernel: &Kernel) {
        let count = self.spectra.len();
        if count > 0 {
            self.newest = (self.newest + 1) % count;
            let spectrum = &mut self.spectra[self.newest];
            for (bin, &x) in spectrum.iter_mut().zip(&self.input) {
                *bin = Complex::new(x, 0.0);
            }
            response
                .forward
                .process_with_scratch(spectrum, &mut self.scratch);

            // Partition k + 1 pairs with the spectrum k blocks before the newest.
            self.accum.fill(Complex::new(0.0, 0.0));
            for (k, h) in kernel.tail.iter().enumerate() {
                let x = &self.spectra[(self.newest + count - k) % count];
                for ((acc, x), h) in self.accum.iter_mut().zip(x).zip(h) {
                    *acc += x * h;
                }
            }
            response
                .inverse
                .process_with_scratch(&mut self.accum, &mut self.scratch);
            for (out, y) in self.tail_out.iter_mut().zip(&self.accum[PARTITION_FRAMES..]) {
                *out = y.re;
            }
        }
        self.input.copy_within(PARTITION_FRAMES.., 0);
        self.fill = 0;
    }
}

/// Control-side handle of a [`ConvolverNode`].
#[derive(Debug, Clone)]
pub struct ConvolverControl {
    slot: Arc<Staged<ImpulseResponse>>,
    normalize: Arc<AtomicBool>,
    loader: Arc<Mutex<Option<Arc<AsyncLoader<ImpulseResponse>>>>>,
}

impl ConvolverControl {
    /// Hand a response to the renderer. It takes effect at the node's next
    /// quantum.
    pub fn set_impulse_response(&self, response: ImpulseResponse) {
        self.slot.stage(response);
    }

    /// Hand over the response `loader` produces, when it produces one.
    /// The loader is kept so [`load_error`](Self::load_error) can report it.
    pub fn load(&self, loader: &Arc<AsyncLoader<ImpulseResponse>>) {
        loader.subscribe(&self.slot);
        *self.loader.lock() = Some(Arc::clone(loader));
    }

    /// The failure of the last loader passed to [`load`](Self::load).
    pub fn load_error(&self) -> Option<LoadError> {
        self.loader.lock().as_ref().and_then(|loader| loader.error())
    }

    /// Whether the last loader is still running.
    pub fn is_loading(&self) -> bool {
        self.loader
            .lock()
            .as_ref()
            .is_some_and(|loader| !loader.is_finished())
    }

    /// Whether responses are scaled to a calibrated level.
    pub fn normalize(&self) -> bool {
        self.normalize.load(Ordering::Acquire)
    }

    /// Enable or disable normalization. Applies from the next quantum.
    pub fn set_normalize(&self, normalize: bool) {
        self.normalize.store(normalize, Ordering::Release);
    }
}

/// Partitioned FFT convolver.
pub struct ConvolverNode {
    control: ConvolverControl,
    response: Option<Arc<ImpulseResponse>>,
    lanes: Vec<Lane>,
}

impl ConvolverNode {
    /// A convolver with no response, normalizing by default.
    pub fn new() -> Self {
        Self {
            control: ConvolverControl {
                slot: Arc::new(Staged::new()),
                normalize: Arc::new(AtomicBool::new(true)),
                loader: Arc::new(Mutex::new(None)),
            },
            response: None,
            lanes: Vec::new(),
        }
    }

    /// Handle for loading responses after the node moves into the graph.
    pub fn control(&self) -> ConvolverControl {
        self.control.clone()
    }

    // Lane buffers are sized by the response, so a swap reallocates them.
    fn install(&mut self, response: Arc<ImpulseResponse>) {
        let channels = self.lanes.len();
        self.lanes.clear();
        self.lanes
            .extend((0..channels).map(|_| Lane::new(&response)));
        self.response = Some(response);
    }

    fn ensure_lanes(&mut self, response: &ImpulseResponse, channels: usize) {
        while self.lanes.len() < channels {
            self.lanes.push(Lane::new(response));
        }
    }
}

impl Default for ConvolverNode {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ConvolverNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConvolverNode")
            .field("response", &self.response)
            .field("lanes", &self.lanes.len())
            .finish_non_exhaustive()
    }
}

impl AudioProcessor for ConvolverNode {
    fn name(&self) -> &'static str {
        "convolver"
    }

    fn layout(&self) -> NodeLayout {
        NodeLayout::effect()
    }

    fn uninitialize(&mut self) {
        self.lanes.clear();
    }

    fn reset(&mut self) {
        for lane in &mut self.lanes {
            lane.clear();
        }
    }

    fn tail_time(&self) -> f64 {
        self.response.as_ref().map_or(0.0, |r| r.duration())
    }

    fn process(&mut self, scope: &mut ProcessScope<'_, '_>) {
        if let Some(response) = self.control.slot.take() {
            self.install(response);
        }

        let input = scope.input(0);
        let output = scope.output(0);
        let input = input.read();
        let mut output = output.write();
        output.mix_from(&input);

        let Some(response) = self.response.clone() else {
            return;
        };
        let frames = scope.frames().min(output.length());
        let gain = if self.control.normalize() {
            response.normalization_scale()
        } else {
            1.0
        };

        self.ensure_lanes(&response, output.number_of_channels());
        for (c, (channel, lane)) in output.channels_mut().zip(&mut self.lanes).enumerate() {
            lane.process(&response, response.kernel(c), &mut channel[..frames], gain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(kernel: &[f32], input: &[f32]) -> Vec<f32> {
        (0..input.len())
            .map(|n| {
                kernel
                    .iter()
                    .enumerate()
                    .filter(|(t, _)| *t <= n)
                    .map(|(t, h)| h * input[n - t])
                    .sum()
            })
            .collect()
    }

    fn test_signal(len: usize) -> Vec<f32> {
        (0..len).map(|n| ((n * 7 + 3) % 11) as f32 / 11.0 - 0.5).collect()
    }

    #[test]
    fn invalid_responses_are_rejected() {
        assert!(ImpulseResponse::new(Vec::new(), 44100.0).is_err());
        assert!(ImpulseResponse::new(vec![Vec::new()], 44100.0).is_err());
        assert!(ImpulseResponse::new(vec![vec![1.0], vec![1.0, 0.0]], 44100.0).is_err());
        assert!(ImpulseResponse::new(vec![vec![1.0]], 0.0).is_err());
    }

    #[test]
    fn unit_impulse_normalizes_to_calibration_gain() {
        let ir = ImpulseResponse::new(vec![vec![1.0]], 44100.0).expect("ir");
        assert!((ir.normalization_scale() - GAIN_CALIBRATION).abs() < 1e-9);
        assert_eq!(ir.length(), 1);
        assert_eq!(ir.number_of_partitions(), 1);
    }

    #[test]
    fn channel_index_clamps_to_last() {
        let ir = ImpulseResponse::new(vec![vec![1.0, 0.0], vec![0.0, 1.0]], 48000.0).expect("ir");
        assert_eq!(ir.channel(5), &[0.0, 1.0]);
    }

    #[test]
    fn duration_follows_length() {
        let ir = ImpulseResponse::new(vec![vec![0.0; 4410]], 44100.0).expect("ir");
        assert!((ir.duration() - 0.1).abs() < 1e-12);
        assert_eq!(ir.number_of_partitions(), 4410usize.div_ceil(PARTITION_FRAMES));
    }

    #[test]
    fn partitioned_matches_direct_convolution() {
        let kernel = test_signal(3 * PARTITION_FRAMES + 37);
        let input = test_signal(9 * PARTITION_FRAMES + 5);
        let ir = ImpulseResponse::new(vec![kernel.clone()], 44100.0).expect("ir");
        let expected = direct(&kernel, &input);

        let mut lane = Lane::new(&ir);
        let mut output = input.clone();
        // Odd chunk sizes so blocks straddle quanta.
        for chunk in output.chunks_mut(48) {
            lane.process(&ir, ir.kernel(0), chunk, 1.0);
        }
        for (n, (got, want)) in output.iter().zip(&expected).enumerate() {
            assert!(
                (got - want).abs() < 1e-3 * want.abs().max(1.0),
                "frame {n}: got {got}, want {want}"
            );
        }
    }

    #[test]
    fn clear_forgets_history() {
        let kernel = test_signal(2 * PARTITION_FRAMES);
        let ir = ImpulseResponse::new(vec![kernel], 44100.0).expect("ir");
        let mut lane = Lane::new(&ir);
        let mut noise = test_signal(3 * PARTITION_FRAMES);
        lane.process(&ir, ir.kernel(0), &mut noise, 1.0);
        lane.clear();

        let mut silence = vec![0.0; 3 * PARTITION_FRAMES];
        lane.process(&ir, ir.kernel(0), &mut silence, 1.0);
        assert!(silence.iter().all(|&s| s == 0.0));
    }
}
