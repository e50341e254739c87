//! Output context and playback transport.
//!
//! One `OutputContext` exists per processing zone. It owns the platform
//! output stream (built lazily on a dedicated thread, shared across source
//! changes) and the transport state. The stream callback reads everything it
//! needs through atomics and a try-locked source slot — the control plane
//! never blocks the audio thread.
//!
//! The context may be constructed with audio output disabled: every state
//! transition, transport operation and analysis behaves identically, there
//! is just no platform stream. This doubles as the device-free test mode.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use serde::Serialize;

use crate::error::{AudioError, Result};
use crate::graph::chain::{Biquad, ChainRuntime};

/// Engine rate; every clip is resampled to this at import.
pub const TARGET_SAMPLE_RATE: u32 = 48_000;

/// State of the process-wide output facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

/// Playback state published for display.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSnapshot {
    pub is_playing: bool,
    pub position_seconds: f32,
    pub duration_seconds: f32,
}

/// Per-source state shared with the stream callback.
pub struct SourceRuntime {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    cursor: AtomicUsize,
    outputting: AtomicBool,
}

impl SourceRuntime {
    pub fn samples(&self) -> Arc<Vec<f32>> {
        self.samples.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// What the stream callback sees: the current source (swapped on selection
/// change) and the chain parameter block (stable for the context lifetime).
struct RuntimeSlot {
    source: Mutex<Option<Arc<SourceRuntime>>>,
    chain: Arc<ChainRuntime>,
}

// Transport pause keeps the stream alive outputting silence; the stream
// itself only ever starts or shuts down.
enum StreamCmd {
    Play,
    Shutdown,
}

struct StreamWorker {
    cmd_tx: mpsc::Sender<StreamCmd>,
    handle: Option<thread::JoinHandle<()>>,
}

struct LoadedTransport {
    duration: f32,
    sample_rate: u32,
    source: Arc<SourceRuntime>,
}

struct ContextInner {
    state: ContextState,
    output_enabled: bool,
    /// Set when stream creation failed; reported once, never retried.
    unavailable: bool,
    worker: Option<StreamWorker>,
    loaded: Option<LoadedTransport>,
    is_playing: bool,
    current_time: f32,
    start_offset: f32,
    start_instant: Option<Instant>,
}

#[derive(Clone)]
pub struct OutputContext {
    inner: Arc<Mutex<ContextInner>>,
    slot: Arc<RuntimeSlot>,
}

impl OutputContext {
    pub fn new(output_enabled: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContextInner {
                state: ContextState::Suspended,
                output_enabled,
                unavailable: false,
                worker: None,
                loaded: None,
                is_playing: false,
                current_time: 0.0,
                start_offset: 0.0,
                start_instant: None,
            })),
            slot: Arc::new(RuntimeSlot {
                source: Mutex::new(None),
                chain: Arc::new(ChainRuntime::new()),
            }),
        }
    }

    /// The chain parameter block shared with the callback and the tap. One
    /// per context lifetime; stage identity changes travel through its
    /// generation counter.
    pub fn chain_runtime(&self) -> Arc<ChainRuntime> {
        self.slot.chain.clone()
    }

    pub fn state(&self) -> ContextState {
        self.inner.lock().expect("output context poisoned").state
    }

    pub fn output_enabled(&self) -> bool {
        self.inner
            .lock()
            .expect("output context poisoned")
            .output_enabled
    }

    /// Resume a suspended context. Idempotent; the Running confirmation is
    /// what gates the controller's Ready transition.
    pub fn resume(&self) -> Result<ContextState> {
        let mut inner = self.inner.lock().expect("output context poisoned");
        Self::resume_locked(&mut inner, &self.slot)
    }

    fn resume_locked(inner: &mut ContextInner, slot: &Arc<RuntimeSlot>) -> Result<ContextState> {
        match inner.state {
            ContextState::Closed => Err(AudioError::ContextUnavailable(
                "output context is closed".into(),
            )),
            ContextState::Running => Ok(ContextState::Running),
            ContextState::Suspended => {
                if inner.output_enabled {
                    Self::ensure_worker(inner, slot)?;
                    if let Some(worker) = &inner.worker {
                        let _ = worker.cmd_tx.send(StreamCmd::Play);
                    }
                }
                inner.state = ContextState::Running;
                Ok(ContextState::Running)
            }
        }
    }

    fn ensure_worker(inner: &mut ContextInner, slot: &Arc<RuntimeSlot>) -> Result<()> {
        if inner.worker.is_some() {
            return Ok(());
        }
        if inner.unavailable {
            // Already reported; degrade without retrying.
            return Err(AudioError::ContextUnavailable(
                "output device unavailable".into(),
            ));
        }
        match spawn_stream(slot.clone(), TARGET_SAMPLE_RATE) {
            Ok(worker) => {
                inner.worker = Some(worker);
                Ok(())
            }
            Err(err) => {
                inner.unavailable = true;
                log::error!("[output] no audio available: {}", err);
                Err(AudioError::ContextUnavailable(err))
            }
        }
    }

    /// Close the context and drop the platform stream. Idempotent; a closed
    /// context never runs again.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("output context poisoned");
        if inner.state == ContextState::Closed {
            return;
        }
        Self::stop_transport_locked(&mut inner);
        if let Some(mut worker) = inner.worker.take() {
            let _ = worker.cmd_tx.send(StreamCmd::Shutdown);
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
        inner.state = ContextState::Closed;
    }

    /// Install a new source into the callback slot, replacing any previous
    /// one, and reset the transport. The graph controller owns when this
    /// happens; the context only effectuates it.
    pub fn install_source(
        &self,
        samples: Arc<Vec<f32>>,
        sample_rate: u32,
    ) -> Result<Arc<SourceRuntime>> {
        let mut inner = self.inner.lock().expect("output context poisoned");
        if inner.state == ContextState::Closed {
            return Err(AudioError::ContextUnavailable(
                "output context is closed".into(),
            ));
        }
        let duration = if sample_rate == 0 {
            0.0
        } else {
            samples.len() as f32 / sample_rate as f32
        };
        let source = Arc::new(SourceRuntime {
            samples,
            sample_rate,
            cursor: AtomicUsize::new(0),
            outputting: AtomicBool::new(false),
        });
        *self.slot.source.lock().expect("runtime slot poisoned") = Some(source.clone());
        inner.loaded = Some(LoadedTransport {
            duration,
            sample_rate,
            source: source.clone(),
        });
        inner.is_playing = false;
        inner.current_time = 0.0;
        inner.start_offset = 0.0;
        inner.start_instant = None;
        Ok(source)
    }

    /// Remove the current source from the callback slot.
    pub fn clear_source(&self) {
        let mut inner = self.inner.lock().expect("output context poisoned");
        Self::stop_transport_locked(&mut inner);
        *self.slot.source.lock().expect("runtime slot poisoned") = None;
        inner.loaded = None;
        inner.current_time = 0.0;
        inner.start_offset = 0.0;
    }

    pub fn has_source(&self) -> bool {
        self.inner
            .lock()
            .expect("output context poisoned")
            .loaded
            .is_some()
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Start playback at the current position. Playing while suspended
    /// resumes the context first.
    pub fn play(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("output context poisoned");
        if inner.state == ContextState::Suspended {
            Self::resume_locked(&mut inner, &self.slot)?;
        }
        if inner.state != ContextState::Running {
            return Err(AudioError::ContextUnavailable(
                "output context is closed".into(),
            ));
        }
        let loaded = inner
            .loaded
            .as_ref()
            .ok_or_else(|| AudioError::SourceUnavailable("no clip loaded".into()))?;

        let duration = loaded.duration;
        let sample_rate = loaded.sample_rate;
        let source = loaded.source.clone();

        let start_seconds = inner.current_time.clamp(0.0, duration);
        inner.current_time = start_seconds;
        inner.start_offset = start_seconds;

        if duration <= 0.0 || start_seconds >= duration {
            inner.current_time = duration;
            return Ok(());
        }

        inner.is_playing = true;
        inner.start_instant = Some(Instant::now());

        let start_sample = (start_seconds * sample_rate as f32).floor() as usize;
        source.cursor.store(start_sample, Ordering::SeqCst);
        source.outputting.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock().expect("output context poisoned");
        if inner.is_playing {
            if let Some(start) = inner.start_instant.take() {
                let elapsed = start.elapsed().as_secs_f32();
                let duration = inner.loaded.as_ref().map(|l| l.duration).unwrap_or(0.0);
                inner.current_time = (inner.start_offset + elapsed).min(duration);
            }
        }
        Self::stop_transport_locked(&mut inner);
        inner.start_offset = inner.current_time;
    }

    pub fn seek(&self, seconds: f32) -> Result<()> {
        let mut inner = self.inner.lock().expect("output context poisoned");
        let (duration, sample_rate, source) = match &inner.loaded {
            Some(l) => (l.duration, l.sample_rate, l.source.clone()),
            None => {
                inner.current_time = 0.0;
                return Ok(());
            }
        };

        if duration <= 0.0 {
            inner.current_time = 0.0;
            return Ok(());
        }

        let clamped = seconds.clamp(0.0, duration);
        inner.current_time = clamped;
        inner.start_offset = clamped;

        let sample_idx = (clamped * sample_rate as f32).floor() as usize;
        source.cursor.store(sample_idx, Ordering::SeqCst);

        if inner.is_playing {
            inner.start_instant = Some(Instant::now());
        }
        Ok(())
    }

    pub fn transport(&self) -> TransportSnapshot {
        let mut inner = self.inner.lock().expect("output context poisoned");
        Self::refresh_progress_locked(&mut inner);
        TransportSnapshot {
            is_playing: inner.is_playing,
            position_seconds: inner.current_time,
            duration_seconds: inner.loaded.as_ref().map(|l| l.duration).unwrap_or(0.0),
        }
    }

    /// Current playhead in seconds; wall-clock derived while playing.
    pub fn position_seconds(&self) -> f32 {
        let mut inner = self.inner.lock().expect("output context poisoned");
        Self::refresh_progress_locked(&mut inner);
        inner.current_time
    }

    pub fn is_transport_playing(&self) -> bool {
        let mut inner = self.inner.lock().expect("output context poisoned");
        Self::refresh_progress_locked(&mut inner);
        inner.is_playing
    }

    fn stop_transport_locked(inner: &mut ContextInner) {
        inner.is_playing = false;
        inner.start_instant = None;
        if let Some(loaded) = &inner.loaded {
            loaded.source.outputting.store(false, Ordering::SeqCst);
        }
    }

    fn refresh_progress_locked(inner: &mut ContextInner) {
        let duration = match &inner.loaded {
            Some(l) => l.duration,
            None => return,
        };
        if !inner.is_playing || duration <= 0.0 {
            return;
        }
        if let Some(start) = inner.start_instant {
            let elapsed = start.elapsed().as_secs_f32();
            let position = inner.start_offset + elapsed;
            if position >= duration {
                inner.current_time = duration;
                Self::stop_transport_locked(inner);
                inner.start_offset = inner.current_time;
            } else {
                inner.current_time = position;
            }
        }
    }
}

/// Build the platform stream on its own thread. The stream starts paused —
/// the context is suspended until the first resume.
fn spawn_stream(
    slot: Arc<RuntimeSlot>,
    sample_rate: u32,
) -> std::result::Result<StreamWorker, String> {
    let (cmd_tx, cmd_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

    let handle = thread::spawn(move || {
        let outcome = (|| -> std::result::Result<(), String> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or("no output device available")?;

            let supported_config = device
                .default_output_config()
                .map_err(|e| format!("failed to get output config: {}", e))?;
            let channels = supported_config.channels();

            let config = StreamConfig {
                channels,
                sample_rate: SampleRate(sample_rate),
                buffer_size: BufferSize::Default,
            };

            let callback_slot = slot.clone();
            let mut biquad: Option<Biquad> = None;
            let mut last_generation = callback_slot.chain.filter_generation();

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let ch = channels as usize;

                        // Parameters are sampled once per buffer: changes land
                        // at the next processing boundary, monotonically.
                        let source = match callback_slot.source.try_lock() {
                            Ok(guard) => guard.clone(),
                            Err(_) => None,
                        };
                        let Some(src) = source else {
                            data.fill(0.0);
                            return;
                        };

                        let gain = if callback_slot.chain.gain_connected() {
                            callback_slot.chain.gain()
                        } else {
                            1.0
                        };

                        if callback_slot.chain.filter_connected() {
                            let generation = callback_slot.chain.filter_generation();
                            let coeffs = callback_slot.chain.filter_coeffs();
                            match biquad.as_mut() {
                                // Same stage: swap coefficients, keep state.
                                Some(b) if generation == last_generation => b.set_coeffs(coeffs),
                                // Replaced stage: state starts from silence.
                                _ => biquad = Some(Biquad::new(coeffs)),
                            }
                            last_generation = generation;
                        } else {
                            biquad = None;
                        }

                        let total = src.samples.len();
                        for frame in data.chunks_mut(ch) {
                            let raw = if src.outputting.load(Ordering::Relaxed) {
                                let idx = src.cursor.load(Ordering::Relaxed);
                                if idx < total {
                                    src.cursor.fetch_add(1, Ordering::Relaxed);
                                    src.samples[idx]
                                } else {
                                    0.0
                                }
                            } else {
                                0.0
                            };

                            let mut sample = raw * gain;
                            if let Some(b) = biquad.as_mut() {
                                sample = b.process(sample);
                            }
                            for out in frame.iter_mut() {
                                *out = sample;
                            }
                        }
                    },
                    |err| {
                        log::error!("[output] stream error: {}", err);
                    },
                    None,
                )
                .map_err(|e| format!("failed to build output stream: {}", e))?;

            let _ = ready_tx.send(Ok(()));

            while let Ok(cmd) = cmd_rx.recv() {
                match cmd {
                    StreamCmd::Play => {
                        if let Err(err) = stream.play() {
                            log::error!("[output] failed to start stream: {}", err);
                        }
                    }
                    StreamCmd::Shutdown => break,
                }
            }
            drop(stream);
            Ok(())
        })();

        if let Err(err) = outcome {
            let _ = ready_tx.send(Err(err));
        }
    });

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(StreamWorker {
            cmd_tx,
            handle: Some(handle),
        }),
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err)
        }
        Err(_) => Err("stream worker failed to start".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn offline_context() -> OutputContext {
        OutputContext::new(false)
    }

    fn short_clip(context: &OutputContext, seconds: f32) {
        let samples: Vec<f32> = vec![0.25; (seconds * TARGET_SAMPLE_RATE as f32) as usize];
        context
            .install_source(Arc::new(samples), TARGET_SAMPLE_RATE)
            .expect("install");
    }

    #[test]
    fn resume_transitions_suspended_to_running() {
        let context = offline_context();
        assert_eq!(context.state(), ContextState::Suspended);
        assert_eq!(context.resume().expect("resume"), ContextState::Running);
        assert_eq!(context.state(), ContextState::Running);
    }

    #[test]
    fn resume_is_idempotent() {
        let context = offline_context();
        context.resume().expect("first");
        assert_eq!(context.resume().expect("second"), ContextState::Running);
    }

    #[test]
    fn closed_context_never_runs_again() {
        let context = offline_context();
        context.close();
        context.close(); // idempotent
        assert_eq!(context.state(), ContextState::Closed);
        assert!(matches!(
            context.resume(),
            Err(AudioError::ContextUnavailable(_))
        ));
    }

    #[test]
    fn play_without_clip_is_source_unavailable() {
        let context = offline_context();
        context.resume().expect("resume");
        assert!(matches!(
            context.play(),
            Err(AudioError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn play_while_suspended_resumes_first() {
        let context = offline_context();
        short_clip(&context, 1.0);
        context.play().expect("play");
        assert_eq!(context.state(), ContextState::Running);
        assert!(context.is_transport_playing());
    }

    #[test]
    fn seek_clamps_into_clip_range() {
        let context = offline_context();
        short_clip(&context, 1.0);
        context.seek(5.0).expect("seek past end");
        assert!((context.transport().position_seconds - 1.0).abs() < 1e-3);
        context.seek(-2.0).expect("seek before start");
        assert_eq!(context.transport().position_seconds, 0.0);
    }

    #[test]
    fn transport_stops_at_end_of_clip() {
        let context = offline_context();
        short_clip(&context, 0.05);
        context.play().expect("play");
        std::thread::sleep(Duration::from_millis(90));
        let snap = context.transport();
        assert!(!snap.is_playing);
        assert!((snap.position_seconds - snap.duration_seconds).abs() < 1e-3);
    }

    #[test]
    fn installing_a_source_resets_the_transport() {
        let context = offline_context();
        short_clip(&context, 1.0);
        context.play().expect("play");
        context.seek(0.5).expect("seek");
        short_clip(&context, 2.0);
        let snap = context.transport();
        assert!(!snap.is_playing);
        assert_eq!(snap.position_seconds, 0.0);
        assert!((snap.duration_seconds - 2.0).abs() < 1e-3);
    }

    #[test]
    fn clear_source_empties_the_slot() {
        let context = offline_context();
        short_clip(&context, 1.0);
        assert!(context.has_source());
        context.clear_source();
        assert!(!context.has_source());
        assert_eq!(context.transport().duration_seconds, 0.0);
    }
}
