//! Analysis tap: a passive probe off the final stage of the chain.
//!
//! The tap never terminates the signal and never blocks. A snapshot pulls
//! the current transport window from the source, applies the chain's
//! published stages to it (the spectrum shows processed audio, not raw), and
//! runs a Hann-windowed forward FFT. With the context suspended — or nothing
//! audible — the snapshot is all zeros rather than an error.

use std::sync::Arc;

use serde::Serialize;

use crate::audio::{FftService, FFT_SIZE, SPECTRUM_BINS};
use crate::graph::chain::{process_block, ChainRuntime};
use crate::output::{ContextState, OutputContext, SourceRuntime};

/// Ordered byte magnitudes, produced fresh per request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencySnapshot {
    pub bins: Vec<u8>,
}

impl FrequencySnapshot {
    pub fn silent() -> Self {
        Self {
            bins: vec![0; SPECTRUM_BINS],
        }
    }

    pub fn is_silent(&self) -> bool {
        self.bins.iter().all(|&b| b == 0)
    }
}

/// A live attachment point. Cloneable so the render loop can poll without
/// going through the controller; all clones observe the same graph state.
#[derive(Clone)]
pub struct TapHandle {
    inner: Arc<TapInner>,
}

struct TapInner {
    context: OutputContext,
    source: Arc<SourceRuntime>,
    chain: Arc<ChainRuntime>,
    fft: FftService,
}

impl TapHandle {
    /// One frequency-domain snapshot of the processed signal. Never blocks;
    /// returns silence unless the context is running and the transport is
    /// audible.
    pub fn snapshot(&self) -> FrequencySnapshot {
        let inner = &self.inner;
        if inner.context.state() != ContextState::Running {
            return FrequencySnapshot::silent();
        }
        if !inner.context.is_transport_playing() {
            // Paused or ended: the audible path is silence, so is the tap.
            return FrequencySnapshot::silent();
        }

        let samples = inner.source.samples();
        let sample_rate = inner.source.sample_rate();
        let position = inner.context.position_seconds();
        let end = ((position * sample_rate as f32) as usize).min(samples.len());
        let start = end.saturating_sub(FFT_SIZE);

        let mut window: Vec<f32> = samples[start..end].to_vec();
        let gain = inner.chain.gain_connected().then(|| inner.chain.gain());
        let filter = inner
            .chain
            .filter_connected()
            .then(|| inner.chain.filter_coeffs());
        process_block(&mut window, gain, filter);

        FrequencySnapshot {
            bins: inner.fft.byte_spectrum(&window),
        }
    }
}

/// The tap component owned by the graph controller. Attachment is idempotent
/// per graph generation: attaching to the point it is already on returns the
/// existing handle without making a new connection.
pub struct AnalysisTap {
    fft: FftService,
    handle: Option<TapHandle>,
}

impl AnalysisTap {
    pub fn new(fft: FftService) -> Self {
        Self { fft, handle: None }
    }

    /// Attach behind the chain's final stage for the given source.
    pub fn attach(
        &mut self,
        context: &OutputContext,
        source: Arc<SourceRuntime>,
        chain: Arc<ChainRuntime>,
    ) -> TapHandle {
        if let Some(existing) = &self.handle {
            if Arc::ptr_eq(&existing.inner.source, &source) {
                return existing.clone();
            }
        }
        let handle = TapHandle {
            inner: Arc::new(TapInner {
                context: context.clone(),
                source,
                chain,
                fft: self.fft.clone(),
            }),
        };
        self.handle = Some(handle.clone());
        handle
    }

    /// Drop the attachment. Idempotent.
    pub fn detach(&mut self) {
        self.handle = None;
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<TapHandle> {
        self.handle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::TARGET_SAMPLE_RATE;

    fn running_context_with_tone(freq: f32) -> (OutputContext, Arc<SourceRuntime>) {
        let context = OutputContext::new(false);
        let samples: Vec<f32> = (0..TARGET_SAMPLE_RATE as usize)
            .map(|i| {
                (2.0 * std::f32::consts::PI * freq * i as f32 / TARGET_SAMPLE_RATE as f32).sin()
                    * 0.5
            })
            .collect();
        let source = context
            .install_source(Arc::new(samples), TARGET_SAMPLE_RATE)
            .expect("install");
        context.resume().expect("resume");
        (context, source)
    }

    #[test]
    fn suspended_context_snapshots_are_silent() {
        let context = OutputContext::new(false);
        let samples = vec![0.5f32; TARGET_SAMPLE_RATE as usize];
        let source = context
            .install_source(Arc::new(samples), TARGET_SAMPLE_RATE)
            .expect("install");
        let mut tap = AnalysisTap::new(FftService::new());
        let handle = tap.attach(&context, source, context.chain_runtime());
        assert!(handle.snapshot().is_silent());
    }

    #[test]
    fn playing_tone_yields_a_non_silent_snapshot() {
        let (context, source) = running_context_with_tone(1_000.0);
        let mut tap = AnalysisTap::new(FftService::new());
        let handle = tap.attach(&context, source, context.chain_runtime());

        context.play().expect("play");
        context.seek(0.5).expect("seek into the tone");
        let snap = handle.snapshot();
        assert!(!snap.is_silent());
        assert_eq!(snap.bins.len(), SPECTRUM_BINS);
    }

    #[test]
    fn paused_transport_is_silent() {
        let (context, source) = running_context_with_tone(1_000.0);
        let mut tap = AnalysisTap::new(FftService::new());
        let handle = tap.attach(&context, source, context.chain_runtime());
        context.play().expect("play");
        context.pause();
        assert!(handle.snapshot().is_silent());
    }

    #[test]
    fn reattach_to_the_same_point_returns_the_same_handle() {
        let (context, source) = running_context_with_tone(440.0);
        let mut tap = AnalysisTap::new(FftService::new());
        let a = tap.attach(&context, source.clone(), context.chain_runtime());
        let b = tap.attach(&context, source, context.chain_runtime());
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn snapshot_reflects_the_gain_stage() {
        let (context, source) = running_context_with_tone(1_000.0);
        let chain = context.chain_runtime();
        let mut tap = AnalysisTap::new(FftService::new());
        let handle = tap.attach(&context, source, chain.clone());

        context.play().expect("play");
        context.seek(0.5).expect("seek");

        chain.set_gain_connected(true);
        chain.set_gain(1.0);
        let unity: u32 = handle.snapshot().bins.iter().map(|&b| b as u32).sum();
        chain.set_gain(0.05);
        let quiet: u32 = handle.snapshot().bins.iter().map(|&b| b as u32).sum();
        assert!(
            unity > quiet,
            "gain reduction should lower the spectrum: unity={unity} quiet={quiet}"
        );
    }
}
