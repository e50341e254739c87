use realfft::{RealFftPlanner, RealToComplex};
use std::f32::consts::PI;
use std::sync::Arc;

pub const FFT_SIZE: usize = 2048;

/// Number of magnitude bins exposed per snapshot (half the transform size).
pub const SPECTRUM_BINS: usize = FFT_SIZE / 2;

/// Byte-magnitude mapping range, in decibels relative to full scale.
/// Anything at or below MIN_DECIBELS maps to 0, anything at or above
/// MAX_DECIBELS maps to 255.
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Shared forward-FFT plan and analysis window.
///
/// Cloning is cheap; the plan is reference-counted and reused by every
/// snapshot so the planner only runs once per process.
#[derive(Clone)]
pub struct FftService {
    plan: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
}

impl FftService {
    pub fn new() -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(FFT_SIZE);
        let window = hann_window(FFT_SIZE);
        Self { plan, window }
    }

    /// Compute the byte spectrum of one analysis window.
    ///
    /// `samples` holds up to FFT_SIZE samples; shorter input is treated as
    /// zero-padded at the front. Returns SPECTRUM_BINS magnitudes mapped to
    /// bytes over the [MIN_DECIBELS, MAX_DECIBELS] range.
    pub fn byte_spectrum(&self, samples: &[f32]) -> Vec<u8> {
        let mut input = self.plan.make_input_vec();
        let mut spectrum = self.plan.make_output_vec();

        let pad = FFT_SIZE.saturating_sub(samples.len());
        for slot in input.iter_mut().take(pad) {
            *slot = 0.0;
        }
        for (i, &sample) in samples.iter().rev().take(FFT_SIZE).rev().enumerate() {
            input[pad + i] = sample * self.window[pad + i];
        }

        let mut bins = vec![0u8; SPECTRUM_BINS];
        if self.plan.process(&mut input, &mut spectrum).is_ok() {
            for (bin, out) in spectrum.iter().take(SPECTRUM_BINS).zip(bins.iter_mut()) {
                *out = magnitude_to_byte(bin.norm() / FFT_SIZE as f32);
            }
        }
        bins
    }
}

impl Default for FftService {
    fn default() -> Self {
        Self::new()
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let angle = 2.0 * PI * i as f32 / (size as f32 - 1.0);
            0.5 * (1.0 - angle.cos())
        })
        .collect()
}

fn magnitude_to_byte(normalized: f32) -> u8 {
    if normalized <= 0.0 {
        return 0;
    }
    let db = 20.0 * normalized.log10();
    let scaled = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
    (scaled.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate).sin() * amplitude)
            .collect()
    }

    #[test]
    fn silence_maps_to_all_zero_bins() {
        let fft = FftService::new();
        let bins = fft.byte_spectrum(&vec![0.0; FFT_SIZE]);
        assert!(bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn sine_peaks_in_the_expected_bin() {
        let fft = FftService::new();
        let sample_rate = 48_000.0;
        // Bin center frequency so leakage doesn't smear the peak; amplitude
        // low enough that neighboring bins don't clamp to 255 with it.
        let bin = 64;
        let freq = bin as f32 * sample_rate / FFT_SIZE as f32;
        let bins = fft.byte_spectrum(&sine(freq, sample_rate, FFT_SIZE, 0.1));

        let (peak_bin, peak) = bins
            .iter()
            .enumerate()
            .max_by_key(|(_, &v)| v)
            .expect("non-empty spectrum");
        assert_eq!(peak_bin, bin);
        assert!(*peak > 128, "full-ish scale sine should be loud, got {peak}");
    }

    #[test]
    fn byte_mapping_is_monotonic_in_level() {
        let fft = FftService::new();
        let sample_rate = 48_000.0;
        let freq = 64.0 * sample_rate / FFT_SIZE as f32;
        let quiet = fft.byte_spectrum(&sine(freq, sample_rate, FFT_SIZE, 0.01));
        let loud = fft.byte_spectrum(&sine(freq, sample_rate, FFT_SIZE, 0.8));
        assert!(loud[64] > quiet[64]);
    }

    #[test]
    fn short_input_is_front_padded() {
        let fft = FftService::new();
        let bins = fft.byte_spectrum(&[0.5; 32]);
        assert_eq!(bins.len(), SPECTRUM_BINS);
    }
}
