//! Soundbox: an audio clip workbench.
//!
//! Clips come in through the acquisition side of [`library::MediaLibrary`],
//! live in an in-memory gallery, and play through a gain + filter chain
//! wired by [`graph::GraphController`] into one [`output::OutputContext`].
//! A [`spectrum::SpectrumRenderer`] polls the chain's analysis tap and draws
//! the processed spectrum; [`zone::ProcessingZone`] ties all of it together
//! behind the parameter surface the UI binds to.

pub mod audio;
pub mod error;
pub mod graph;
pub mod library;
pub mod output;
pub mod spectrum;
pub mod zone;

pub use error::AudioError;
pub use graph::{ChainParams, FilterKind, GraphController, GraphPhase, GraphState, StageSpec};
pub use library::{ClipMeta, ClipSummary, MediaHandle, MediaLibrary};
pub use output::{ContextState, OutputContext, TransportSnapshot, TARGET_SAMPLE_RATE};
pub use spectrum::{SpectrumRenderer, SpectrumSurface};
pub use zone::{ParamView, ProcessingZone, ZoneConfig};
