//! The processing zone: owns the output context, the graph controller and
//! the one active spectrum renderer, and exposes the parameter surface the
//! UI controls bind to.
//!
//! Gallery selection flows in through `select`; every parameter setter goes
//! through the controller's single reconfiguration entry point. The
//! visualization loop is started optimistically on selection and idles until
//! the context actually runs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::FftService;
use crate::error::Result;
use crate::graph::chain::{ChainParams, FilterKind};
use crate::graph::controller::{GraphController, GraphPhase, GraphState};
use crate::library::MediaHandle;
use crate::output::{ContextState, OutputContext, TransportSnapshot};
use crate::spectrum::{
    SpectrumRenderer, SpectrumSurface, DEFAULT_SURFACE_HEIGHT, DEFAULT_SURFACE_WIDTH,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ZoneConfig {
    /// Disable to run without a platform stream (analysis still works).
    pub output_enabled: bool,
    pub frame_interval_ms: u64,
    pub surface_width: usize,
    pub surface_height: usize,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            output_enabled: true,
            frame_interval_ms: 16,
            surface_width: DEFAULT_SURFACE_WIDTH,
            surface_height: DEFAULT_SURFACE_HEIGHT,
        }
    }
}

/// Current control values, shaped for the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamView {
    pub gain_value: f32,
    pub filter_type: String,
    pub filter_frequency: f32,
}

pub struct ProcessingZone {
    config: ZoneConfig,
    context: OutputContext,
    controller: GraphController,
    surface: Arc<Mutex<SpectrumSurface>>,
    renderer: Option<SpectrumRenderer>,
}

impl ProcessingZone {
    /// Build a zone. The platform stream itself is created lazily, on the
    /// first resume — constructing a zone is cheap and infallible.
    pub fn new(config: ZoneConfig) -> Self {
        let context = OutputContext::new(config.output_enabled);
        let controller = GraphController::new(context.clone(), FftService::new());
        let surface = Arc::new(Mutex::new(SpectrumSurface::new(
            config.surface_width,
            config.surface_height,
        )));
        Self {
            config,
            context,
            controller,
            surface,
            renderer: None,
        }
    }

    // -------------------------------------------------------------------------
    // Gallery input
    // -------------------------------------------------------------------------

    /// Feed the gallery selection in. `None` releases the graph entirely and
    /// cancels the render loop. Must be called inside a tokio runtime (the
    /// render loop is a task).
    pub fn select(&mut self, media: Option<MediaHandle>) -> Result<GraphPhase> {
        match media {
            None => {
                let phase = self.controller.set_source(None)?;
                self.stop_visualization();
                Ok(phase)
            }
            Some(media) => match self.controller.set_source(Some(media)) {
                Ok(phase) => {
                    self.start_visualization();
                    Ok(phase)
                }
                Err(err) => {
                    self.stop_visualization();
                    Err(err)
                }
            },
        }
    }

    // -------------------------------------------------------------------------
    // UI controls
    // -------------------------------------------------------------------------

    pub fn set_gain(&mut self, value: f32) -> Result<()> {
        let params = ChainParams {
            gain: value,
            ..self.controller.params()
        };
        self.controller.apply_params(params)
    }

    pub fn set_filter_kind(&mut self, kind: Option<FilterKind>) -> Result<()> {
        let params = ChainParams {
            filter_kind: kind,
            ..self.controller.params()
        };
        self.controller.apply_params(params)
    }

    /// Set the filter by UI name; "none" removes the stage.
    pub fn set_filter_type(&mut self, name: &str) -> Result<()> {
        self.set_filter_kind(FilterKind::from_name(name))
    }

    pub fn set_filter_frequency(&mut self, frequency: f32) -> Result<()> {
        let params = ChainParams {
            filter_frequency: frequency,
            ..self.controller.params()
        };
        self.controller.apply_params(params)
    }

    pub fn params(&self) -> ParamView {
        let params = self.controller.params();
        ParamView {
            gain_value: params.gain,
            filter_type: params
                .filter_kind
                .map(|k| k.name().to_string())
                .unwrap_or_else(|| "none".to_string()),
            filter_frequency: params.filter_frequency,
        }
    }

    // -------------------------------------------------------------------------
    // Readiness and transport
    // -------------------------------------------------------------------------

    pub fn set_ready_listener<F: Fn() + Send + 'static>(&mut self, listener: F) {
        self.controller.set_ready_listener(listener);
    }

    pub fn request_ready(&mut self) -> Result<GraphPhase> {
        self.controller.request_ready()
    }

    pub fn phase(&self) -> GraphPhase {
        self.controller.phase()
    }

    pub fn graph_state(&self) -> &GraphState {
        self.controller.graph_state()
    }

    pub fn context_state(&self) -> ContextState {
        self.context.state()
    }

    /// Start playback. A play action on a suspended context resumes it and
    /// fires the ready transition first.
    pub fn play(&mut self) -> Result<()> {
        self.controller.request_ready()?;
        self.context.play()
    }

    pub fn pause(&mut self) {
        self.context.pause();
    }

    pub fn seek(&mut self, seconds: f32) -> Result<()> {
        self.context.seek(seconds)
    }

    pub fn transport(&self) -> TransportSnapshot {
        self.context.transport()
    }

    // -------------------------------------------------------------------------
    // Visualization
    // -------------------------------------------------------------------------

    pub fn surface(&self) -> Arc<Mutex<SpectrumSurface>> {
        self.surface.clone()
    }

    pub fn visualization_active(&self) -> bool {
        self.renderer.as_ref().map(|r| r.is_live()).unwrap_or(false)
    }

    pub fn frames_drawn(&self) -> u64 {
        self.renderer
            .as_ref()
            .map(|r| r.frames_drawn())
            .unwrap_or(0)
    }

    fn start_visualization(&mut self) {
        // Exactly one loop per zone: cancel any prior loop before starting.
        self.stop_visualization();
        if let Some(tap) = self.controller.tap_handle() {
            self.renderer = Some(SpectrumRenderer::spawn(
                tap,
                self.context.clone(),
                self.surface.clone(),
                Duration::from_millis(self.config.frame_interval_ms),
            ));
        }
    }

    fn stop_visualization(&mut self) {
        if let Some(renderer) = self.renderer.take() {
            renderer.cancel();
        }
    }

    /// Release everything: render loop, graph, context. Used on unmount;
    /// also what `Drop` runs.
    pub fn teardown(&mut self) {
        self.stop_visualization();
        self.controller.teardown();
        self.context.close();
    }
}

impl Drop for ProcessingZone {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::test_support::{sine, write_wav};
    use crate::library::MediaLibrary;
    use crate::output::TARGET_SAMPLE_RATE;

    fn offline_zone() -> ProcessingZone {
        ProcessingZone::new(ZoneConfig {
            output_enabled: false,
            frame_interval_ms: 5,
            surface_width: 120,
            surface_height: 40,
        })
    }

    fn clip(dir: &tempfile::TempDir, library: &MediaLibrary, name: &str) -> MediaHandle {
        let path = dir.path().join(name);
        write_wav(&path, &sine(1_000.0, TARGET_SAMPLE_RATE, 3.2), TARGET_SAMPLE_RATE);
        let id = library.import_file(&path).expect("import");
        library.select(Some(id)).expect("select").expect("handle")
    }

    #[test]
    fn config_defaults_cover_the_standard_surface() {
        let config: ZoneConfig = serde_json::from_str("{}").expect("defaults");
        assert!(config.output_enabled);
        assert_eq!(config.frame_interval_ms, 16);
        assert_eq!(config.surface_width, 600);
        assert_eq!(config.surface_height, 150);
    }

    #[test]
    fn params_view_starts_at_the_documented_defaults() {
        let zone = offline_zone();
        let view = zone.params();
        assert_eq!(view.gain_value, 1.0);
        assert_eq!(view.filter_type, "none");
        assert_eq!(view.filter_frequency, 350.0);
    }

    #[tokio::test]
    async fn selection_starts_the_loop_and_deselection_cancels_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let library = MediaLibrary::new(TARGET_SAMPLE_RATE);
        let mut zone = offline_zone();

        zone.select(Some(clip(&dir, &library, "a.wav"))).expect("select");
        assert!(zone.visualization_active());
        assert_eq!(zone.phase(), GraphPhase::Connected);

        zone.select(None).expect("deselect");
        assert!(!zone.visualization_active());
        assert_eq!(zone.phase(), GraphPhase::Empty);
        assert!(!zone.graph_state().connected);
    }

    #[tokio::test]
    async fn ready_gates_drawing_and_fires_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().expect("tempdir");
        let library = MediaLibrary::new(TARGET_SAMPLE_RATE);
        let mut zone = offline_zone();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        zone.set_ready_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        zone.select(Some(clip(&dir, &library, "a.wav"))).expect("select");
        assert!((zone.transport().duration_seconds - 3.2).abs() < 0.05);

        // Optimistically started loop idles while suspended.
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(zone.frames_drawn(), 0);

        zone.request_ready().expect("ready");
        zone.request_ready().expect("ready again");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(zone.phase(), GraphPhase::Ready);

        zone.play().expect("play");
        zone.seek(1.0).expect("seek");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(zone.frames_drawn() > 0);
        assert!(zone.surface().lock().unwrap().lit_pixels() > 0);
    }

    #[tokio::test]
    async fn filter_swap_while_ready_keeps_the_loop_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let library = MediaLibrary::new(TARGET_SAMPLE_RATE);
        let mut zone = offline_zone();

        zone.select(Some(clip(&dir, &library, "a.wav"))).expect("select");
        zone.set_filter_type("lowpass").expect("lowpass");
        zone.set_filter_frequency(1_000.0).expect("tune");
        zone.play().expect("play");
        zone.seek(0.5).expect("seek");

        tokio::time::sleep(Duration::from_millis(30)).await;
        let frames_before = zone.frames_drawn();
        assert!(frames_before > 0);
        assert!(zone.visualization_active());

        zone.set_filter_type("highpass").expect("swap kind");
        assert_eq!(zone.phase(), GraphPhase::Ready);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            zone.frames_drawn() > frames_before,
            "the render loop must continue across a stage replacement"
        );
    }

    #[tokio::test]
    async fn deselect_while_ready_stops_frames_for_good() {
        let dir = tempfile::tempdir().expect("tempdir");
        let library = MediaLibrary::new(TARGET_SAMPLE_RATE);
        let mut zone = offline_zone();

        zone.select(Some(clip(&dir, &library, "a.wav"))).expect("select");
        zone.play().expect("play");
        zone.seek(0.5).expect("seek");
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(zone.frames_drawn() > 0);

        zone.select(None).expect("deselect");
        assert!(!zone.visualization_active());
        assert!(zone.graph_state().stage_snapshot.is_empty());

        // Paint a sentinel frame; any continuation still firing would clear
        // it on its next draw.
        {
            let mut bins = vec![0u8; crate::audio::SPECTRUM_BINS];
            bins[2] = 220;
            zone.surface()
                .lock()
                .unwrap()
                .draw(&crate::graph::tap::FrequencySnapshot { bins });
        }
        let sentinel = zone.surface().lock().unwrap().lit_pixels();
        assert!(sentinel > 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(zone.surface().lock().unwrap().lit_pixels(), sentinel);
    }

    #[tokio::test]
    async fn reselection_replaces_the_loop_instead_of_stacking() {
        let dir = tempfile::tempdir().expect("tempdir");
        let library = MediaLibrary::new(TARGET_SAMPLE_RATE);
        let mut zone = offline_zone();

        zone.select(Some(clip(&dir, &library, "a.wav"))).expect("first");
        zone.select(Some(clip(&dir, &library, "b.wav"))).expect("second");
        assert!(zone.visualization_active());

        zone.teardown();
        assert!(!zone.visualization_active());
        assert_eq!(zone.context_state(), ContextState::Closed);
    }
}
