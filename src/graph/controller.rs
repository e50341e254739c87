//! Graph controller: one idempotent entry point for every parameter and
//! source change.
//!
//! The controller recomputes the full topology on each change, validates it
//! as a DAG, and diffs it structurally against what is currently wired. A
//! shape-preserving change patches stage parameters in place; a shape change
//! tears down exactly the edges downstream of the first differing stage and
//! rebuilds from there. Every structural edit is recorded, so reconnection
//! cost is observable and testable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use uuid::Uuid;

use crate::audio::FftService;
use crate::error::{AudioError, Result};
use crate::graph::chain::{
    ChainParams, ChainTopology, EffectChain, FilterKind, StageIdentity, StageSpec,
};
use crate::graph::source::SignalSource;
use crate::graph::tap::{AnalysisTap, TapHandle};
use crate::library::MediaHandle;
use crate::output::{ContextState, OutputContext, SourceRuntime, TARGET_SAMPLE_RATE};

/// Controller readiness phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphPhase {
    /// No source.
    Empty,
    /// Source present, graph being (re)assembled.
    Building,
    /// Full path established, output state unknown.
    Connected,
    /// Output context confirmed running.
    Ready,
}

/// Nodes of the signal graph. A filter node's identity includes its kind:
/// changing the kind is a node replacement, not a parameter update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphNode {
    Source,
    Gain,
    Filter(FilterKind),
    Tap,
    Sink,
}

/// One structural edit applied to the wired graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphEdit {
    Connect(GraphNode, GraphNode),
    Disconnect(GraphNode, GraphNode),
}

/// Snapshot of the wired graph, recomputed (never patched in place) on every
/// relevant change.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphState {
    pub connected: bool,
    pub source_identity: Option<Uuid>,
    pub stage_snapshot: Vec<StageSpec>,
    pub analysis_attached: bool,
}

pub struct GraphController {
    context: OutputContext,
    chain: EffectChain,
    tap: AnalysisTap,
    source: Option<SignalSource>,
    source_runtime: Option<Arc<SourceRuntime>>,
    params: ChainParams,
    phase: GraphPhase,
    state: GraphState,
    /// Edges currently wired, in build order.
    wired: Vec<(GraphNode, GraphNode)>,
    /// Structural edits performed by the most recent operation.
    edits: Vec<GraphEdit>,
    ready_listener: Option<Box<dyn Fn() + Send>>,
    /// Whether the listener has fired for the current readiness period.
    /// Reset on source changes, never by parameter-driven rebuilds.
    ready_signalled: bool,
}

impl GraphController {
    pub fn new(context: OutputContext, fft: FftService) -> Self {
        let chain = EffectChain::new(context.chain_runtime(), TARGET_SAMPLE_RATE);
        Self {
            context,
            chain,
            tap: AnalysisTap::new(fft),
            source: None,
            source_runtime: None,
            params: ChainParams::default(),
            phase: GraphPhase::Empty,
            state: GraphState::default(),
            wired: Vec::new(),
            edits: Vec::new(),
            ready_listener: None,
            ready_signalled: false,
        }
    }

    /// Register the callback fired on each transition into `Ready`. Fired at
    /// most once per readiness period.
    pub fn set_ready_listener<F: Fn() + Send + 'static>(&mut self, listener: F) {
        self.ready_listener = Some(Box::new(listener));
    }

    pub fn phase(&self) -> GraphPhase {
        self.phase
    }

    pub fn graph_state(&self) -> &GraphState {
        &self.state
    }

    pub fn params(&self) -> ChainParams {
        self.params
    }

    pub fn context(&self) -> &OutputContext {
        &self.context
    }

    /// Structural edits performed by the most recent set_source/apply_params
    /// call. Empty means the operation touched no connections.
    pub fn last_edits(&self) -> &[GraphEdit] {
        &self.edits
    }

    pub fn tap_handle(&self) -> Option<TapHandle> {
        self.tap.handle()
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Replace (or remove) the wired source. The previous path is always torn
    /// down fully before the new one is built — two sources are never wired
    /// to the sink at once.
    pub fn set_source(&mut self, media: Option<MediaHandle>) -> Result<GraphPhase> {
        self.edits.clear();
        self.teardown_wired();
        self.ready_signalled = false;

        let Some(media) = media else {
            self.phase = GraphPhase::Empty;
            return Ok(self.phase);
        };

        self.phase = GraphPhase::Building;
        match self.build(media) {
            Ok(()) => {
                self.phase = GraphPhase::Connected;
                // The context survives source changes; if it is already
                // running this is a fresh transition into Ready.
                if self.context.state() == ContextState::Running {
                    self.enter_ready();
                }
                Ok(self.phase)
            }
            Err(err) => {
                // All-or-nothing: a failed build ends fully disconnected.
                self.teardown_wired();
                self.phase = GraphPhase::Empty;
                Err(err)
            }
        }
    }

    /// Recompute the chain topology from new parameters.
    ///
    /// Same stage shape: parameters are patched in place, zero structural
    /// edits. Changed shape: exactly the edges downstream of the first
    /// differing stage are replaced. The readiness period is preserved — a
    /// parameter change never re-fires the ready listener.
    pub fn apply_params(&mut self, params: ChainParams) -> Result<()> {
        self.edits.clear();
        let params = params.clamped();
        self.params = params;

        if self.source.is_none() {
            return Ok(());
        }

        let new_topo = ChainTopology::configure(&params);
        let old_shape: Vec<StageIdentity> = self
            .chain
            .applied()
            .map(|t| t.shape())
            .unwrap_or_default();

        if new_topo.shape() == old_shape {
            self.chain.apply(&new_topo);
            self.state.stage_snapshot = new_topo.stages().to_vec();
            return Ok(());
        }

        let prior_phase = self.phase;
        self.phase = GraphPhase::Building;

        let new_edges = match Self::validate_and_order(&new_topo) {
            Ok(edges) => edges,
            Err(err) => {
                // Nothing was touched; the wired graph stands.
                self.phase = prior_phase;
                return Err(err);
            }
        };

        let old_set: HashSet<(GraphNode, GraphNode)> = self.wired.iter().copied().collect();
        let new_set: HashSet<(GraphNode, GraphNode)> = new_edges.iter().copied().collect();

        // Tear down removed edges in reverse build order, then bring up the
        // added ones in build order, re-attaching tap and sink at the end.
        for &(a, b) in self.wired.iter().rev() {
            if !new_set.contains(&(a, b)) {
                self.edits.push(GraphEdit::Disconnect(a, b));
            }
        }
        for &(a, b) in new_edges.iter() {
            if !old_set.contains(&(a, b)) {
                self.edits.push(GraphEdit::Connect(a, b));
            }
        }

        self.wired = new_edges;
        self.chain.apply(&new_topo);
        self.chain.set_connections(&new_topo);
        if let Some(runtime) = &self.source_runtime {
            // Idempotent per graph generation: same source, same handle.
            self.tap
                .attach(&self.context, runtime.clone(), self.chain.runtime());
        }
        self.state.stage_snapshot = new_topo.stages().to_vec();
        self.phase = prior_phase;
        Ok(())
    }

    /// Gate visualization start on the context actually running. Idempotent:
    /// the listener fires exactly once per transition into Ready, no matter
    /// how many triggers invoke this.
    pub fn request_ready(&mut self) -> Result<GraphPhase> {
        match self.phase {
            GraphPhase::Empty | GraphPhase::Building => Ok(self.phase),
            GraphPhase::Ready => Ok(GraphPhase::Ready),
            GraphPhase::Connected => {
                self.context.resume()?;
                self.enter_ready();
                Ok(self.phase)
            }
        }
    }

    /// Disconnect every owned node in reverse build order. Safe to call at
    /// any time; releasing a never-connected node is a no-op.
    pub fn teardown(&mut self) {
        self.edits.clear();
        self.teardown_wired();
        self.phase = GraphPhase::Empty;
        self.ready_signalled = false;
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn enter_ready(&mut self) {
        self.phase = GraphPhase::Ready;
        if !self.ready_signalled {
            self.ready_signalled = true;
            log::info!("[graph] ready");
            if let Some(listener) = &self.ready_listener {
                listener();
            }
        }
    }

    fn build(&mut self, media: MediaHandle) -> Result<()> {
        let source_identity = media.id();
        let topo = ChainTopology::configure(&self.params);
        let edges = Self::validate_and_order(&topo)?;

        let mut source = SignalSource::new(media);
        let tap_out = source
            .attach()
            .map_err(|e| AudioError::GraphBuildFailed(format!("tap creation refused: {}", e)))?;

        let runtime = match self
            .context
            .install_source(tap_out.samples(), tap_out.sample_rate())
        {
            Ok(runtime) => runtime,
            Err(err) => {
                source.detach();
                return Err(AudioError::GraphBuildFailed(err.to_string()));
            }
        };

        self.chain.apply(&topo);
        self.chain.set_connections(&topo);
        self.tap
            .attach(&self.context, runtime.clone(), self.chain.runtime());

        for &(a, b) in &edges {
            self.edits.push(GraphEdit::Connect(a, b));
        }
        log::info!(
            "[graph] wired source {} through {} stage(s)",
            source_identity,
            topo.stages().len()
        );

        self.wired = edges;
        self.source = Some(source);
        self.source_runtime = Some(runtime);
        self.state = GraphState {
            connected: true,
            source_identity: Some(source_identity),
            stage_snapshot: topo.stages().to_vec(),
            analysis_attached: true,
        };
        Ok(())
    }

    fn teardown_wired(&mut self) {
        for (a, b) in std::mem::take(&mut self.wired).into_iter().rev() {
            self.edits.push(GraphEdit::Disconnect(a, b));
        }
        self.tap.detach();
        self.chain.teardown();
        if let Some(mut source) = self.source.take() {
            source.detach();
        }
        self.source_runtime = None;
        self.context.clear_source();
        self.state = GraphState::default();
    }

    fn topology_edges(topo: &ChainTopology) -> Vec<(GraphNode, GraphNode)> {
        let mut edges = Vec::new();
        let mut prev = GraphNode::Source;
        for stage in topo.stages() {
            let node = match stage.identity() {
                StageIdentity::Gain => GraphNode::Gain,
                StageIdentity::Filter(kind) => GraphNode::Filter(kind),
            };
            edges.push((prev, node));
            prev = node;
        }
        // The tap hangs off the final stage as a side branch and never feeds
        // the sink; its edge is wired ahead of the sink edge.
        edges.push((prev, GraphNode::Tap));
        edges.push((prev, GraphNode::Sink));
        edges
    }

    /// Fixed tie-break for edges leaving the same node.
    fn build_order(node: GraphNode) -> usize {
        match node {
            GraphNode::Source => 0,
            GraphNode::Gain => 1,
            GraphNode::Filter(_) => 2,
            GraphNode::Tap => 3,
            GraphNode::Sink => 4,
        }
    }

    /// Build the petgraph view of the topology, reject cycles, and return the
    /// edges in build order (topological).
    fn validate_and_order(topo: &ChainTopology) -> Result<Vec<(GraphNode, GraphNode)>> {
        let edges = Self::topology_edges(topo);

        let mut graph: DiGraph<GraphNode, ()> = DiGraph::new();
        let mut indices: HashMap<GraphNode, NodeIndex> = HashMap::new();
        for &(a, b) in &edges {
            for node in [a, b] {
                indices
                    .entry(node)
                    .or_insert_with(|| graph.add_node(node));
            }
        }
        for &(a, b) in &edges {
            graph.add_edge(indices[&a], indices[&b], ());
        }

        let sorted = toposort(&graph, None).map_err(|_| {
            AudioError::GraphBuildFailed("signal graph has a cycle".into())
        })?;
        let rank: HashMap<GraphNode, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, idx)| (graph[*idx], i))
            .collect();

        let mut ordered = edges;
        ordered.sort_by_key(|&(a, b)| (rank[&a], Self::build_order(b)));
        Ok(ordered)
    }
}

impl Drop for GraphController {
    fn drop(&mut self) {
        self.teardown();
    }
}
