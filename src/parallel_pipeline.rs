// THEORY:
// Matching and correction must run frame pair after frame pair with a single
// writer over the node graph. Candidate edge construction does not: the overlap
// edges of frames (f, f+1) only read the shapes created from the input, so every
// frame pair can be computed at the same time.
//
// The `ParallelGraphBuilder` snapshots each frame, computes the edges of all
// frame pairs on tokio's blocking pool (shape intersection is CPU work), keeps at
// most `workers` pairs in flight, and receives the results in frame order. The
// edges are then applied one pair after another, exactly as the sequential
// builder does, so both produce the same graph.
//
// `ParallelPipeline` uses it for step 1 and then hands the graph to the regular
// sequential frame loop.

use crate::core_modules::frame_graph::{Edge, FrameEntry, FrameGraphBuilder, apply_edges, frame_entries, pair_edges};
use crate::core_modules::node::NodeGraph;
use crate::core_modules::region::RegionShape;
use crate::core_modules::watershed::WatershedSplitter;
use crate::error::{TrackError, TrackResult};
use crate::pipeline::{TrackingOutcome, TrackingPipeline};
use futures::stream::{self, StreamExt};
use log::debug;
use std::sync::Arc;

/// Builds the node graph with the edges of all frame pairs computed concurrently.
#[derive(Debug, Clone)]
pub struct ParallelGraphBuilder {
    max_distance: f64,
    workers: usize,
}

impl ParallelGraphBuilder {
    /// One worker per CPU.
    pub fn new(max_distance: f64) -> Self {
        Self {
            max_distance,
            workers: num_cpus::get().max(1),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn build<S>(&self, frames: Vec<Vec<S>>) -> TrackResult<NodeGraph<S>>
    where
        S: RegionShape + Send + Sync + 'static,
    {
        let mut graph = FrameGraphBuilder::new(self.max_distance).create_nodes(frames)?;
        let snapshots: Vec<Arc<Vec<FrameEntry<S>>>> = (1..=graph.frame_count())
            .map(|f| Arc::new(frame_entries(&graph, f)))
            .collect();

        let max_distance = self.max_distance;
        let tasks = snapshots.windows(2).map(|pair| {
            let prev = Arc::clone(&pair[0]);
            let next = Arc::clone(&pair[1]);
            async move {
                tokio::task::spawn_blocking(move || pair_edges(&prev, &next, max_distance))
                    .await
                    .map_err(|e| TrackError::Worker(e.to_string()))
            }
        });
        let results: Vec<TrackResult<Vec<Edge>>> =
            stream::iter(tasks).buffered(self.workers).collect().await;

        for (i, edges) in results.into_iter().enumerate() {
            let edges = edges?;
            debug!("frame {}: {} overlap candidates", i + 2, edges.len());
            apply_edges(&mut graph, &edges);
        }
        Ok(graph)
    }
}

/// A `TrackingPipeline` whose graph construction runs on worker threads.
pub struct ParallelPipeline<W> {
    pipeline: TrackingPipeline<W>,
    builder: ParallelGraphBuilder,
}

impl<W> ParallelPipeline<W> {
    pub fn new(pipeline: TrackingPipeline<W>) -> Self {
        let builder = ParallelGraphBuilder::new(pipeline.config().max_distance);
        Self { pipeline, builder }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.builder = self.builder.with_workers(workers);
        self
    }

    pub async fn track<S>(&mut self, frames: Vec<Vec<S>>) -> TrackResult<TrackingOutcome<S>>
    where
        S: RegionShape + Send + Sync + 'static,
        W: WatershedSplitter<S>,
    {
        let graph = self.builder.build(frames).await?;
        self.pipeline.track_graph(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::mask_shape::MaskShape;
    use crate::pipeline::TrackingConfig;

    fn drifting_sequence() -> Vec<Vec<MaskShape>> {
        (0..6u32)
            .map(|t| {
                vec![
                    MaskShape::rect(t * 2, 0, 10, 10, 0).unwrap(),
                    MaskShape::rect(40, t * 3, 12, 8, 0).unwrap(),
                    MaskShape::disk(80.0 - t as f64, 40.0, 6.0, 0).unwrap(),
                ]
            })
            .collect()
    }

    #[tokio::test]
    async fn builds_the_same_graph_as_the_sequential_builder() {
        let sequential = FrameGraphBuilder::new(100.0).build(drifting_sequence()).unwrap();
        let parallel = ParallelGraphBuilder::new(100.0)
            .with_workers(3)
            .build(drifting_sequence())
            .await
            .unwrap();

        assert_eq!(format!("{sequential:?}"), format!("{parallel:?}"));
    }

    #[tokio::test]
    async fn parallel_pipeline_tracks_like_the_sequential_one() {
        let expected = TrackingPipeline::with_config(TrackingConfig::default())
            .unwrap()
            .track(drifting_sequence())
            .unwrap();

        let mut pipeline =
            ParallelPipeline::new(TrackingPipeline::with_config(TrackingConfig::default()).unwrap());
        let outcome = pipeline.track(drifting_sequence()).await.unwrap();

        assert_eq!(outcome.report, expected.report);
        assert_eq!(outcome.trajectories.len(), 3);
        for (a, b) in outcome.trajectories.iter().zip(&expected.trajectories) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.frames(), b.frames());
            assert_eq!(a.frames(), (1..=6).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn single_frame_has_no_edges() {
        let graph = ParallelGraphBuilder::new(50.0)
            .build(vec![vec![MaskShape::rect(0, 0, 5, 5, 0).unwrap()]])
            .await
            .unwrap();
        assert_eq!(graph.frame_count(), 1);
        assert!(graph.node(graph.frame(1)[0]).overlap.next.is_empty());
    }
}
