//! Spectrum renderer: a cooperative, cancellable loop that pulls one
//! frequency snapshot per frame and draws bars into a pixel surface.
//!
//! Each iteration checks the liveness token before doing anything — a
//! cancelled loop never fires its continuation. A suspended context makes
//! the loop idle-reschedule without drawing, so it can be started
//! optimistically and begin drawing the instant the context runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::graph::tap::{FrequencySnapshot, TapHandle};
use crate::output::{ContextState, OutputContext};

/// Canvas background, rgb(40, 44, 52).
pub const BACKGROUND: [u8; 3] = [40, 44, 52];

pub const DEFAULT_SURFACE_WIDTH: usize = 600;
pub const DEFAULT_SURFACE_HEIGHT: usize = 150;

/// RGB row-major pixel surface the renderer draws into.
pub struct SpectrumSurface {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl SpectrumSurface {
    pub fn new(width: usize, height: usize) -> Self {
        let mut surface = Self {
            width,
            height,
            pixels: vec![0; width * height * 3],
        };
        surface.clear();
        surface
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let base = (y * self.width + x) * 3;
        [self.pixels[base], self.pixels[base + 1], self.pixels[base + 2]]
    }

    pub fn clear(&mut self) {
        for chunk in self.pixels.chunks_exact_mut(3) {
            chunk.copy_from_slice(&BACKGROUND);
        }
    }

    /// Draw one frame of bars. Bar height is half the byte magnitude,
    /// bottom-anchored; the color ramp is a pure function of bin index and
    /// magnitude — the same mapping every frame.
    pub fn draw(&mut self, snapshot: &FrequencySnapshot) {
        self.clear();

        let bins = snapshot.bins.len().max(1);
        let bar_width = (self.width as f32 / bins as f32) * 2.5;
        let mut x = 0.0f32;

        for (i, &value) in snapshot.bins.iter().enumerate() {
            if x >= self.width as f32 {
                break;
            }
            let fraction = i as f32 / bins as f32;
            let r = (value as f32 + 25.0 * fraction).min(255.0) as u8;
            let g = (250.0 * fraction) as u8;
            let b = 50u8;

            let bar_height = (value as usize) / 2;
            let x0 = x as usize;
            // Sub-pixel bars still occupy one column.
            let x1 = (((x + bar_width).ceil() as usize).max(x0 + 1)).min(self.width);
            let y0 = self.height.saturating_sub(bar_height.min(self.height));

            for y in y0..self.height {
                for px in x0..x1 {
                    let base = (y * self.width + px) * 3;
                    self.pixels[base] = r;
                    self.pixels[base + 1] = g;
                    self.pixels[base + 2] = b;
                }
            }

            x += bar_width + 1.0;
        }
    }

    /// Pixels that differ from the background; zero for a blank frame.
    pub fn lit_pixels(&self) -> usize {
        self.pixels
            .chunks_exact(3)
            .filter(|p| *p != BACKGROUND)
            .count()
    }
}

impl Default for SpectrumSurface {
    fn default() -> Self {
        Self::new(DEFAULT_SURFACE_WIDTH, DEFAULT_SURFACE_HEIGHT)
    }
}

/// Handle to the running render loop. Dropping it cancels the loop.
pub struct SpectrumRenderer {
    alive: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    handle: tokio::task::JoinHandle<()>,
}

impl SpectrumRenderer {
    /// Start the loop. Must be called inside a tokio runtime. The caller is
    /// responsible for cancelling any previous loop first — two loops must
    /// never draw to the same surface.
    pub fn spawn(
        tap: TapHandle,
        context: OutputContext,
        surface: Arc<Mutex<SpectrumSurface>>,
        frame_interval: Duration,
    ) -> Self {
        let alive = Arc::new(AtomicBool::new(true));
        let frames = Arc::new(AtomicU64::new(0));

        let loop_alive = alive.clone();
        let loop_frames = frames.clone();
        let handle = tokio::spawn(async move {
            loop {
                // Liveness first: a cancelled continuation does nothing.
                if !loop_alive.load(Ordering::SeqCst) {
                    break;
                }
                match context.state() {
                    ContextState::Closed => {
                        // Context is gone; exit without scheduling another
                        // frame.
                        loop_alive.store(false, Ordering::SeqCst);
                        break;
                    }
                    ContextState::Suspended => {
                        // Not an error: reschedule without drawing and start
                        // the instant the context becomes active.
                        tokio::time::sleep(frame_interval).await;
                        continue;
                    }
                    ContextState::Running => {}
                }

                let snapshot = tap.snapshot();
                {
                    let mut surface = surface.lock().expect("spectrum surface poisoned");
                    surface.draw(&snapshot);
                }
                loop_frames.fetch_add(1, Ordering::Relaxed);

                tokio::time::sleep(frame_interval).await;
            }
        });

        Self {
            alive,
            frames,
            handle,
        }
    }

    /// Cancel the loop. The pending continuation observes the flag before
    /// touching the surface and exits.
    pub fn cancel(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.handle.is_finished()
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl Drop for SpectrumRenderer {
    fn drop(&mut self) {
        self.cancel();
    }
}
