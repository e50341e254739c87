//! Effect chain: stage specs, deterministic topology computation, and the
//! runtime parameter block shared with the output stream callback.
//!
//! The chain has a fixed stage order {gain, filter}. Parameter values are
//! published through atomics so the audio callback and the analysis tap read
//! the same state the controller writes, without locking.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub const MIN_FILTER_HZ: f32 = 20.0;
pub const MAX_FILTER_HZ: f32 = 20_000.0;

pub const DEFAULT_GAIN: f32 = 1.0;
pub const DEFAULT_FILTER_HZ: f32 = 350.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Lowpass,
    Highpass,
    Bandpass,
    Notch,
}

impl FilterKind {
    /// Parse a UI-facing name; "none" and unknown names mean no filter.
    pub fn from_name(name: &str) -> Option<FilterKind> {
        match name {
            "lowpass" => Some(FilterKind::Lowpass),
            "highpass" => Some(FilterKind::Highpass),
            "bandpass" => Some(FilterKind::Bandpass),
            "notch" => Some(FilterKind::Notch),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::Lowpass => "lowpass",
            FilterKind::Highpass => "highpass",
            FilterKind::Bandpass => "bandpass",
            FilterKind::Notch => "notch",
        }
    }
}

/// One stage of the chain, with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StageSpec {
    #[serde(rename_all = "camelCase")]
    Gain { value: f32 },
    #[serde(rename_all = "camelCase")]
    Filter { filter: FilterKind, frequency: f32 },
}

/// Stage identity for topology diffing. Two filter stages of different kinds
/// are different stages (a kind change replaces the node); a frequency change
/// is the same stage with a new parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageIdentity {
    Gain,
    Filter(FilterKind),
}

impl StageSpec {
    pub fn identity(&self) -> StageIdentity {
        match self {
            StageSpec::Gain { .. } => StageIdentity::Gain,
            StageSpec::Filter { filter, .. } => StageIdentity::Filter(*filter),
        }
    }
}

/// The full parameter surface exposed to UI controls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainParams {
    pub gain: f32,
    /// `None` means no filter stage ("none" in the UI).
    pub filter_kind: Option<FilterKind>,
    pub filter_frequency: f32,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            gain: DEFAULT_GAIN,
            filter_kind: None,
            filter_frequency: DEFAULT_FILTER_HZ,
        }
    }
}

impl ChainParams {
    /// Clamp values into their legal ranges. Out-of-range input is never
    /// allowed to become a stage parameter.
    pub fn clamped(&self) -> ChainParams {
        ChainParams {
            gain: self.gain.max(0.0),
            filter_kind: self.filter_kind,
            filter_frequency: self.filter_frequency.clamp(MIN_FILTER_HZ, MAX_FILTER_HZ),
        }
    }
}

/// The set and order of stages the chain should present.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTopology {
    stages: Vec<StageSpec>,
}

impl ChainTopology {
    /// Deterministic topology computation: fixed order {gain, filter},
    /// omitting the filter when no kind is selected. Values are clamped.
    pub fn configure(params: &ChainParams) -> ChainTopology {
        let params = params.clamped();
        let mut stages = vec![StageSpec::Gain { value: params.gain }];
        if let Some(kind) = params.filter_kind {
            stages.push(StageSpec::Filter {
                filter: kind,
                frequency: params.filter_frequency,
            });
        }
        ChainTopology { stages }
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Stage identities in order, used for structural diffing.
    pub fn shape(&self) -> Vec<StageIdentity> {
        self.stages.iter().map(|s| s.identity()).collect()
    }

    pub fn gain_value(&self) -> Option<f32> {
        self.stages.iter().find_map(|s| match s {
            StageSpec::Gain { value } => Some(*value),
            _ => None,
        })
    }

    pub fn filter_spec(&self) -> Option<(FilterKind, f32)> {
        self.stages.iter().find_map(|s| match s {
            StageSpec::Filter { filter, frequency } => Some((*filter, *frequency)),
            _ => None,
        })
    }
}

// -----------------------------------------------------------------------------
// Biquad filters
// -----------------------------------------------------------------------------

/// Normalized 2nd-order filter coefficients (a0 divided out).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl BiquadCoeffs {
    /// RBJ cookbook coefficients, Q = 0.707 across all kinds.
    pub fn compute(kind: FilterKind, frequency: f32, sample_rate: f32) -> BiquadCoeffs {
        let cutoff = normalize_cutoff(frequency, sample_rate);
        let omega = 2.0 * std::f32::consts::PI * cutoff / sample_rate;
        let cos_omega = omega.cos();
        let alpha = omega.sin() / (2.0 * 0.707);

        let (b0, b1, b2) = match kind {
            FilterKind::Lowpass => {
                let b = (1.0 - cos_omega) / 2.0;
                (b, 1.0 - cos_omega, b)
            }
            FilterKind::Highpass => {
                let b = (1.0 + cos_omega) / 2.0;
                (b, -(1.0 + cos_omega), b)
            }
            FilterKind::Bandpass => (alpha, 0.0, -alpha),
            FilterKind::Notch => (1.0, -2.0 * cos_omega, 1.0),
        };
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        BiquadCoeffs {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// Keep the cutoff strictly inside (0, nyquist) so the coefficients stay
/// stable regardless of the configured sample rate.
fn normalize_cutoff(cutoff_hz: f32, sample_rate: f32) -> f32 {
    let nyquist = sample_rate * 0.5;
    let max_cutoff = (nyquist - 1.0).max(1.0);
    cutoff_hz.max(1.0).min(max_cutoff)
}

/// Direct-form-I biquad with its own state. The output stream callback and
/// the offline block processor each own one.
#[derive(Debug, Clone, Copy)]
pub struct Biquad {
    coeffs: BiquadCoeffs,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    /// Swap coefficients without clearing state (in-place parameter update).
    pub fn set_coeffs(&mut self, coeffs: BiquadCoeffs) {
        self.coeffs = coeffs;
    }

    /// Clear state (stage replacement).
    pub fn reset(&mut self, coeffs: BiquadCoeffs) {
        *self = Biquad::new(coeffs);
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let c = &self.coeffs;
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Apply the chain's stages to a block from silence, for analysis and
/// offline rendering. The live callback keeps its own filter state instead.
pub fn process_block(samples: &mut [f32], gain: Option<f32>, filter: Option<BiquadCoeffs>) {
    if let Some(gain) = gain {
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
    if let Some(coeffs) = filter {
        let mut biquad = Biquad::new(coeffs);
        for s in samples.iter_mut() {
            *s = biquad.process(*s);
        }
    }
}

// -----------------------------------------------------------------------------
// Runtime parameter block
// -----------------------------------------------------------------------------

/// Chain parameters shared between the control plane, the output stream
/// callback and the analysis tap. All fields are atomics; f32 values travel
/// as raw bits.
pub struct ChainRuntime {
    gain_bits: AtomicU32,
    gain_connected: AtomicBool,
    filter_connected: AtomicBool,
    /// Bumped when the filter stage is replaced; the callback resets its
    /// biquad state when it observes a new generation.
    filter_generation: AtomicU32,
    b0: AtomicU32,
    b1: AtomicU32,
    b2: AtomicU32,
    a1: AtomicU32,
    a2: AtomicU32,
}

impl ChainRuntime {
    pub fn new() -> Self {
        Self {
            gain_bits: AtomicU32::new(DEFAULT_GAIN.to_bits()),
            gain_connected: AtomicBool::new(false),
            filter_connected: AtomicBool::new(false),
            filter_generation: AtomicU32::new(0),
            b0: AtomicU32::new(0),
            b1: AtomicU32::new(0),
            b2: AtomicU32::new(0),
            a1: AtomicU32::new(0),
            a2: AtomicU32::new(0),
        }
    }

    pub fn set_gain(&self, value: f32) {
        self.gain_bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    pub fn set_gain_connected(&self, connected: bool) {
        self.gain_connected.store(connected, Ordering::Relaxed);
    }

    pub fn gain_connected(&self) -> bool {
        self.gain_connected.load(Ordering::Relaxed)
    }

    /// Publish filter coefficients. `new_stage` marks a stage replacement and
    /// tells the callback to clear its filter state.
    pub fn publish_filter(&self, coeffs: BiquadCoeffs, new_stage: bool) {
        self.b0.store(coeffs.b0.to_bits(), Ordering::Relaxed);
        self.b1.store(coeffs.b1.to_bits(), Ordering::Relaxed);
        self.b2.store(coeffs.b2.to_bits(), Ordering::Relaxed);
        self.a1.store(coeffs.a1.to_bits(), Ordering::Relaxed);
        self.a2.store(coeffs.a2.to_bits(), Ordering::Relaxed);
        if new_stage {
            self.filter_generation.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_filter_connected(&self, connected: bool) {
        self.filter_connected.store(connected, Ordering::Relaxed);
    }

    pub fn filter_connected(&self) -> bool {
        self.filter_connected.load(Ordering::Relaxed)
    }

    pub fn filter_generation(&self) -> u32 {
        self.filter_generation.load(Ordering::Relaxed)
    }

    pub fn filter_coeffs(&self) -> BiquadCoeffs {
        BiquadCoeffs {
            b0: f32::from_bits(self.b0.load(Ordering::Relaxed)),
            b1: f32::from_bits(self.b1.load(Ordering::Relaxed)),
            b2: f32::from_bits(self.b2.load(Ordering::Relaxed)),
            a1: f32::from_bits(self.a1.load(Ordering::Relaxed)),
            a2: f32::from_bits(self.a2.load(Ordering::Relaxed)),
        }
    }

    pub fn disconnect_all(&self) {
        self.set_gain_connected(false);
        self.set_filter_connected(false);
    }
}

impl Default for ChainRuntime {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// Effect chain
// -----------------------------------------------------------------------------

/// What an `apply` call actually did, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainUpdate {
    pub gain_patched: bool,
    pub filter_patched: bool,
    pub filter_replaced: bool,
}

/// The ordered stage sequence with stable per-kind identity. Owns the applied
/// topology and publishes parameter changes to the shared runtime block.
pub struct EffectChain {
    runtime: Arc<ChainRuntime>,
    applied: Option<ChainTopology>,
    sample_rate: u32,
}

impl EffectChain {
    pub fn new(runtime: Arc<ChainRuntime>, sample_rate: u32) -> Self {
        Self {
            runtime,
            applied: None,
            sample_rate,
        }
    }

    pub fn runtime(&self) -> Arc<ChainRuntime> {
        self.runtime.clone()
    }

    pub fn applied(&self) -> Option<&ChainTopology> {
        self.applied.as_ref()
    }

    /// Publish a topology's parameters to the runtime.
    ///
    /// An unchanged value is not re-written; a frequency change updates the
    /// existing filter in place; a kind change replaces the filter stage
    /// (state reset via the generation counter). Connection flags are managed
    /// separately by the controller.
    pub fn apply(&mut self, topo: &ChainTopology) -> ChainUpdate {
        let mut update = ChainUpdate::default();

        if let Some(gain) = topo.gain_value() {
            let changed = self
                .applied
                .as_ref()
                .and_then(|t| t.gain_value())
                .map(|prev| prev != gain)
                .unwrap_or(true);
            if changed {
                self.runtime.set_gain(gain);
                update.gain_patched = true;
            }
        }

        if let Some((kind, frequency)) = topo.filter_spec() {
            let prev = self.applied.as_ref().and_then(|t| t.filter_spec());
            let replaced = prev.map(|(k, _)| k != kind).unwrap_or(true);
            let changed = replaced || prev.map(|(_, f)| f != frequency).unwrap_or(true);
            if changed {
                let coeffs = BiquadCoeffs::compute(kind, frequency, self.sample_rate as f32);
                self.runtime.publish_filter(coeffs, replaced);
                update.filter_patched = !replaced;
                update.filter_replaced = replaced;
            }
        }

        self.applied = Some(topo.clone());
        update
    }

    /// Align the runtime connection flags with the stages present in `topo`.
    pub fn set_connections(&self, topo: &ChainTopology) {
        self.runtime.set_gain_connected(topo.gain_value().is_some());
        self.runtime
            .set_filter_connected(topo.filter_spec().is_some());
    }

    /// Disconnect every stage and forget the applied topology.
    pub fn teardown(&mut self) {
        self.runtime.disconnect_all();
        self.applied = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_is_deterministic_and_ordered() {
        let params = ChainParams {
            gain: 0.8,
            filter_kind: Some(FilterKind::Lowpass),
            filter_frequency: 1_000.0,
        };
        let a = ChainTopology::configure(&params);
        let b = ChainTopology::configure(&params);
        assert_eq!(a, b);
        assert_eq!(
            a.shape(),
            vec![StageIdentity::Gain, StageIdentity::Filter(FilterKind::Lowpass)]
        );
    }

    #[test]
    fn no_filter_means_gain_only_topology() {
        // gain-only and gain-plus-none must be topologically identical
        let gain_only = ChainTopology::configure(&ChainParams {
            gain: 1.0,
            filter_kind: None,
            filter_frequency: 350.0,
        });
        assert_eq!(gain_only.shape(), vec![StageIdentity::Gain]);
        assert!(gain_only.filter_spec().is_none());
    }

    #[test]
    fn out_of_range_frequency_is_clamped() {
        let low = ChainParams {
            gain: 1.0,
            filter_kind: Some(FilterKind::Highpass),
            filter_frequency: 5.0,
        };
        let high = ChainParams {
            filter_frequency: 96_000.0,
            ..low
        };
        assert_eq!(
            ChainTopology::configure(&low).filter_spec().unwrap().1,
            MIN_FILTER_HZ
        );
        assert_eq!(
            ChainTopology::configure(&high).filter_spec().unwrap().1,
            MAX_FILTER_HZ
        );
    }

    #[test]
    fn negative_gain_is_clamped_to_zero() {
        let topo = ChainTopology::configure(&ChainParams {
            gain: -0.4,
            filter_kind: None,
            filter_frequency: 350.0,
        });
        assert_eq!(topo.gain_value(), Some(0.0));
    }

    #[test]
    fn reapplying_identical_topology_writes_nothing() {
        let runtime = Arc::new(ChainRuntime::new());
        let mut chain = EffectChain::new(runtime.clone(), 48_000);
        let topo = ChainTopology::configure(&ChainParams {
            gain: 0.5,
            filter_kind: Some(FilterKind::Lowpass),
            filter_frequency: 1_000.0,
        });

        let first = chain.apply(&topo);
        assert!(first.gain_patched && first.filter_replaced);
        let gen = runtime.filter_generation();

        let second = chain.apply(&topo);
        assert_eq!(second, ChainUpdate::default());
        assert_eq!(runtime.filter_generation(), gen);
    }

    #[test]
    fn frequency_change_patches_without_replacing() {
        let runtime = Arc::new(ChainRuntime::new());
        let mut chain = EffectChain::new(runtime.clone(), 48_000);
        let mut params = ChainParams {
            gain: 1.0,
            filter_kind: Some(FilterKind::Lowpass),
            filter_frequency: 1_000.0,
        };
        chain.apply(&ChainTopology::configure(&params));
        let gen = runtime.filter_generation();

        params.filter_frequency = 2_000.0;
        let update = chain.apply(&ChainTopology::configure(&params));
        assert!(update.filter_patched && !update.filter_replaced);
        assert_eq!(runtime.filter_generation(), gen);
    }

    #[test]
    fn kind_change_replaces_the_stage() {
        let runtime = Arc::new(ChainRuntime::new());
        let mut chain = EffectChain::new(runtime.clone(), 48_000);
        let mut params = ChainParams {
            gain: 1.0,
            filter_kind: Some(FilterKind::Lowpass),
            filter_frequency: 1_000.0,
        };
        chain.apply(&ChainTopology::configure(&params));
        let gen = runtime.filter_generation();

        params.filter_kind = Some(FilterKind::Highpass);
        let update = chain.apply(&ChainTopology::configure(&params));
        assert!(update.filter_replaced);
        assert_eq!(runtime.filter_generation(), gen + 1);
    }

    #[test]
    fn lowpass_passes_low_and_rejects_high() {
        let sample_rate = 48_000.0;
        let coeffs = BiquadCoeffs::compute(FilterKind::Lowpass, 500.0, sample_rate);

        let rms = |freq: f32| {
            let mut buf: Vec<f32> = (0..4096)
                .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin())
                .collect();
            process_block(&mut buf, None, Some(coeffs));
            // skip the transient settling at the head
            let tail = &buf[1024..];
            (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32).sqrt()
        };

        let low = rms(100.0);
        let high = rms(8_000.0);
        assert!(
            low > high * 10.0,
            "expected strong rejection above cutoff: low={low} high={high}"
        );
    }

    #[test]
    fn notch_cuts_the_center_frequency() {
        let sample_rate = 48_000.0;
        let coeffs = BiquadCoeffs::compute(FilterKind::Notch, 1_000.0, sample_rate);

        let rms = |freq: f32| {
            let mut buf: Vec<f32> = (0..8192)
                .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin())
                .collect();
            process_block(&mut buf, None, Some(coeffs));
            let tail = &buf[2048..];
            (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32).sqrt()
        };

        let center = rms(1_000.0);
        let off = rms(4_000.0);
        assert!(
            off > center * 4.0,
            "expected the notch to cut its center: center={center} off={off}"
        );
    }

    #[test]
    fn process_block_applies_gain() {
        let mut buf = vec![0.5, -0.5, 0.25];
        process_block(&mut buf, Some(2.0), None);
        assert_eq!(buf, vec![1.0, -1.0, 0.5]);
    }
}
