pub mod chain;
pub mod controller;
pub mod source;
pub mod tap;

pub use chain::{
    BiquadCoeffs, ChainParams, ChainTopology, EffectChain, FilterKind, StageSpec,
    DEFAULT_FILTER_HZ, DEFAULT_GAIN, MAX_FILTER_HZ, MIN_FILTER_HZ,
};
pub use controller::{GraphController, GraphEdit, GraphNode, GraphPhase, GraphState};
pub use source::{OutputTap, SignalSource};
pub use tap::{AnalysisTap, FrequencySnapshot, TapHandle};
