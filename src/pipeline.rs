// THEORY:
// The `pipeline` module is the top-level API of the tracker. It strings the
// layers together in a fixed order:
// 1.  **Graph construction**: every region of every frame becomes a node and
//     adjacent frames are linked by overlap (`FrameGraphBuilder`).
// 2.  **Frame loop**: frame pairs are processed strictly in order 1->2->...->N.
//     For each pair the overlap lists are sorted, the `StableMatcher` pairs the
//     nodes and the `SegmentationCorrector` repairs what the matching could not
//     explain. Frame f+1 is only matched once frame f is fully corrected, because
//     corrections replace nodes that the next pair will propose from.
// 3.  **Assembly**: the `TrajectoryAssembler` walks the resolved chains from the
//     seeds collected along the way.
//
// The pipeline is a finite batch computation; no state survives a call to `track`
// except the trajectory name counter, which lives in the assembler built for it.

use crate::core_modules::corrector::{CorrectionReport, SegmentationCorrector};
use crate::core_modules::frame_graph::FrameGraphBuilder;
use crate::core_modules::matcher::StableMatcher;
use crate::core_modules::node::{MatchMode, NodeGraph, NodeId};
use crate::core_modules::region::RegionShape;
use crate::core_modules::trajectory::{IdGenerator, Trajectory, TrajectoryAssembler, TrajectoryStore};
use crate::core_modules::watershed::{MarkerWatershed, WatershedSplitter};
use crate::error::{TrackError, TrackResult};
use log::info;
use serde::{Deserialize, Serialize};

/// Default overlap prefilter and fallback distance, in pixels.
pub const DEFAULT_MAX_DISTANCE: f64 = 100.0;
pub const DEFAULT_WATERSHED_SIGMA: f64 = 5.0;

/// Configuration for the TrackingPipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Centroid distance under which two nodes of adjacent frames are compared,
    /// for both the overlap prefilter and the distance fallback.
    pub max_distance: f64,
    /// Smoothing of the intensity gradient used by the watershed split.
    pub watershed_sigma: f64,
    pub enable_distance_fallback: bool,
    /// Stage position, inserted into cell names when set.
    pub position: Option<u32>,
    /// Regions smaller than this many pixels are ignored at labeling time.
    pub min_region_area: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_distance: DEFAULT_MAX_DISTANCE,
            watershed_sigma: DEFAULT_WATERSHED_SIGMA,
            enable_distance_fallback: true,
            position: None,
            min_region_area: 1,
        }
    }
}

impl TrackingConfig {
    pub fn validate(&self) -> TrackResult<()> {
        if !self.max_distance.is_finite() || self.max_distance <= 0.0 {
            return Err(TrackError::InvalidConfig(format!(
                "max_distance must be a positive number, got {}",
                self.max_distance
            )));
        }
        if !self.watershed_sigma.is_finite() || self.watershed_sigma <= 0.0 {
            return Err(TrackError::InvalidConfig(format!(
                "watershed_sigma must be a positive number, got {}",
                self.watershed_sigma
            )));
        }
        Ok(())
    }
}

/// Statistics of one tracking run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingReport {
    pub frames: usize,
    /// Active nodes once every correction is applied.
    pub nodes: usize,
    pub trajectories: usize,
    pub corrections: CorrectionReport,
}

/// Everything a run produces: the resolved graph, its trajectories and statistics.
#[derive(Debug)]
pub struct TrackingOutcome<S> {
    pub graph: NodeGraph<S>,
    pub trajectories: Vec<Trajectory<S>>,
    pub report: TrackingReport,
}

/// The main, top-level struct of the tracker.
pub struct TrackingPipeline<W> {
    config: TrackingConfig,
    splitter: W,
}

impl TrackingPipeline<MarkerWatershed> {
    /// Pipeline splitting clusters by shape only.
    pub fn with_config(config: TrackingConfig) -> TrackResult<Self> {
        let splitter = MarkerWatershed::new(config.watershed_sigma as f32);
        Self::new(config, splitter)
    }
}

impl<W> TrackingPipeline<W> {
    pub fn new(config: TrackingConfig, splitter: W) -> TrackResult<Self> {
        config.validate()?;
        Ok(Self { config, splitter })
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Tracks a whole sequence given as one region list per frame.
    pub fn track<S>(&mut self, frames: Vec<Vec<S>>) -> TrackResult<TrackingOutcome<S>>
    where
        S: RegionShape,
        W: WatershedSplitter<S>,
    {
        let graph = FrameGraphBuilder::new(self.config.max_distance).build(frames)?;
        self.track_graph(graph)
    }

    /// Tracks a sequence and hands every trajectory to `store`.
    pub fn track_into<S, T>(&mut self, frames: Vec<Vec<S>>, store: &mut T) -> TrackResult<TrackingReport>
    where
        S: RegionShape,
        W: WatershedSplitter<S>,
        T: TrajectoryStore<S>,
    {
        let outcome = self.track(frames)?;
        for trajectory in outcome.trajectories {
            store.store(trajectory)?;
        }
        Ok(outcome.report)
    }

    /// Runs the frame loop and the assembly over an already linked graph.
    pub fn track_graph<S>(&mut self, mut graph: NodeGraph<S>) -> TrackResult<TrackingOutcome<S>>
    where
        S: RegionShape,
        W: WatershedSplitter<S>,
    {
        let (seeds, mut report) = self.resolve(&mut graph)?;

        let mut assembler = TrajectoryAssembler::new(IdGenerator::new(self.config.position));
        let trajectories = assembler.assemble(&graph, &seeds)?;

        report.nodes = (1..=graph.frame_count()).map(|f| graph.frame(f).len()).sum();
        report.trajectories = trajectories.len();
        info!(
            "tracked {} frames: {} trajectories over {} nodes",
            report.frames, report.trajectories, report.nodes
        );

        Ok(TrackingOutcome {
            graph,
            trajectories,
            report,
        })
    }

    /// Matches and corrects every frame pair in order. Returns the seeds.
    fn resolve<S>(&mut self, graph: &mut NodeGraph<S>) -> TrackResult<(Vec<NodeId>, TrackingReport)>
    where
        S: RegionShape,
        W: WatershedSplitter<S>,
    {
        let matcher = StableMatcher::new(MatchMode::Overlap);
        let corrector =
            SegmentationCorrector::new(self.config.max_distance, self.config.enable_distance_fallback);
        let mut seeds = graph.frame(1).to_vec();
        let mut report = TrackingReport {
            frames: graph.frame_count(),
            ..TrackingReport::default()
        };

        for frame in 1..graph.frame_count() {
            // --- 1. Matching ---
            graph.sort_frame(frame, MatchMode::Overlap);
            graph.sort_frame(frame + 1, MatchMode::Overlap);
            debug_assert!(graph.check_sorted(frame, MatchMode::Overlap));
            debug_assert!(graph.check_sorted(frame + 1, MatchMode::Overlap));

            let remaining = graph.frame(frame).to_vec();
            let next_all = graph.frame(frame + 1).to_vec();
            let outcome = matcher.run(graph, remaining)?;
            let matched = outcome.matched_next.len();

            // --- 2. Correction ---
            let pair = corrector.correct(graph, outcome, &next_all, &mut self.splitter, &mut seeds)?;
            // Split children and fused nodes keep both frames sorted.
            debug_assert!(graph.check_sorted(frame, MatchMode::Overlap));
            debug_assert!(graph.check_sorted(frame + 1, MatchMode::Overlap));
            info!(
                "frame {frame}->{}: {matched} matched, {} split, {} fused, {} divisions, {} by distance, {} new seeds",
                frame + 1,
                pair.clusters_split,
                pair.fusions,
                pair.divisions,
                pair.distance_matches,
                pair.new_seeds
            );
            report.corrections.merge(&pair);
        }

        Ok((seeds, report))
    }
}
