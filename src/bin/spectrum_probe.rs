//! Offline spectrum probe for the processing chain.
//!
//! Decodes a clip, wires it through the gain + filter chain and prints a
//! coarse spectrum at a handful of playhead positions. Useful for checking
//! decode and filter behavior without a display or an output device.
//!
//! Run with: cargo run --bin spectrum_probe -- <file> [filter] [frequency] [gain]

use std::path::PathBuf;

use soundbox::audio::FftService;
use soundbox::graph::{ChainParams, FilterKind, GraphController};
use soundbox::library::MediaLibrary;
use soundbox::output::{OutputContext, TARGET_SAMPLE_RATE};

const COLUMNS: usize = 64;
const LEVELS: &[u8] = b" .:-=+*#%@";

fn render_row(bins: &[u8]) -> String {
    let group = bins.len() / COLUMNS;
    (0..COLUMNS)
        .map(|col| {
            let slice = &bins[col * group..(col + 1) * group];
            let peak = slice.iter().copied().max().unwrap_or(0) as usize;
            let level = peak * (LEVELS.len() - 1) / 255;
            LEVELS[level] as char
        })
        .collect()
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next().map(PathBuf::from) else {
        eprintln!("usage: spectrum_probe <file> [filter] [frequency] [gain]");
        std::process::exit(2);
    };
    let filter_kind = args.next().and_then(|name| FilterKind::from_name(&name));
    let frequency: f32 = args
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1_000.0);
    let gain: f32 = args.next().and_then(|v| v.parse().ok()).unwrap_or(1.0);

    let library = MediaLibrary::new(TARGET_SAMPLE_RATE);
    let id = match library.import_file(&path) {
        Ok(id) => id,
        Err(err) => {
            eprintln!("import failed: {}", err);
            std::process::exit(1);
        }
    };
    let handle = library
        .select(Some(id))
        .expect("clip just imported")
        .expect("selection yields a handle");
    let duration = handle.duration_seconds();

    let context = OutputContext::new(false);
    let mut controller = GraphController::new(context.clone(), FftService::new());
    controller
        .apply_params(ChainParams {
            gain,
            filter_kind,
            filter_frequency: frequency,
        })
        .expect("parameters are clamped, not rejected");
    controller.set_source(Some(handle)).expect("wire the clip");
    controller.request_ready().expect("offline context resumes");

    let tap = controller.tap_handle().expect("tap is attached");

    println!(
        "graph: {}",
        serde_json::to_string(controller.graph_state()).unwrap_or_default()
    );
    println!(
        "{}  {:.2}s  filter={} @ {:.0}Hz  gain={:.2}",
        path.display(),
        duration,
        filter_kind.map(|k| k.name()).unwrap_or("none"),
        frequency,
        gain
    );

    context.play().expect("transport starts");
    let probes = 8;
    for i in 0..probes {
        let t = duration * (i as f32 + 0.5) / probes as f32;
        context.seek(t).expect("seek stays in range");
        let snapshot = tap.snapshot();
        println!("{:6.2}s |{}|", t, render_row(&snapshot.bins));
    }
    context.pause();
    context.close();
}
