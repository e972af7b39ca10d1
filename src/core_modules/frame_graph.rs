// THEORY:
// The `FrameGraphBuilder` turns the per-frame region lists produced by the
// segmentation into the tracking graph. It is the first layer of the tracker and
// it is stateless, in the same way a blob detector knows nothing of past frames:
// - every region becomes a `Node` of its frame;
// - every node of frame f (f > 1) is tested against every node of frame f-1
//   whose centroid lies closer than `max_distance`. The distance test is only a
//   cheap prefilter; a candidate edge is created when the two shapes actually
//   overlap, weighted by the overlap area.
//
// Edge computation for one frame pair only reads shapes, so it is split out in
// `pair_edges`, which the parallel pipeline runs on worker threads.

use crate::core_modules::node::{MatchMode, NodeGraph, NodeId};
use crate::core_modules::region::{RegionShape, centroid_distance};
use crate::error::TrackResult;
use log::debug;

/// A snapshot of one node, enough to compute overlap edges away from the graph.
#[derive(Debug, Clone)]
pub struct FrameEntry<S> {
    pub id: NodeId,
    pub centroid: (f64, f64),
    pub shape: S,
}

/// A weighted overlap edge between two adjacent frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub prev: NodeId,
    pub next: NodeId,
    pub overlap: f64,
}

/// Computes the overlap edges between two adjacent frames.
/// Edges are emitted next-major, in frame-list order on both sides.
pub fn pair_edges<S: RegionShape>(
    prev: &[FrameEntry<S>],
    next: &[FrameEntry<S>],
    max_distance: f64,
) -> Vec<Edge> {
    let mut edges = Vec::new();
    for n in next {
        for p in prev {
            if centroid_distance(n.centroid, p.centroid) >= max_distance {
                continue;
            }
            if let Some(overlap) = p.shape.intersect(&n.shape).map(|s| s.area()) {
                if overlap > 0.0 {
                    edges.push(Edge {
                        prev: p.id,
                        next: n.id,
                        overlap,
                    });
                }
            }
        }
    }
    edges
}

/// Clones the active nodes of `frame` into `FrameEntry` snapshots.
pub fn frame_entries<S: RegionShape>(graph: &NodeGraph<S>, frame: usize) -> Vec<FrameEntry<S>> {
    graph
        .frame(frame)
        .iter()
        .map(|&id| {
            let node = graph.node(id);
            FrameEntry {
                id,
                centroid: node.centroid,
                shape: node.shape.clone(),
            }
        })
        .collect()
}

/// Adds `edges` to the graph as overlap candidates at both ends.
pub fn apply_edges<S: RegionShape>(graph: &mut NodeGraph<S>, edges: &[Edge]) {
    for edge in edges {
        graph.link(edge.prev, edge.next, edge.overlap, MatchMode::Overlap);
    }
}

/// Builds the node graph of a whole sequence.
#[derive(Debug, Clone)]
pub struct FrameGraphBuilder {
    max_distance: f64,
}

impl FrameGraphBuilder {
    pub fn new(max_distance: f64) -> Self {
        Self { max_distance }
    }

    pub fn max_distance(&self) -> f64 {
        self.max_distance
    }

    /// Creates one node per region, frame by frame, without any edge.
    pub fn create_nodes<S: RegionShape>(&self, frames: Vec<Vec<S>>) -> TrackResult<NodeGraph<S>> {
        let mut graph = NodeGraph::new();
        for shapes in frames {
            let frame = graph.push_frame();
            for shape in shapes {
                graph.add_node(frame, shape)?;
            }
        }
        Ok(graph)
    }

    /// Creates the nodes and links every adjacent frame pair.
    pub fn build<S: RegionShape>(&self, frames: Vec<Vec<S>>) -> TrackResult<NodeGraph<S>> {
        let mut graph = self.create_nodes(frames)?;
        for frame in 2..=graph.frame_count() {
            let prev = frame_entries(&graph, frame - 1);
            let next = frame_entries(&graph, frame);
            let edges = pair_edges(&prev, &next, self.max_distance);
            debug!("frame {frame}: {} overlap candidates", edges.len());
            apply_edges(&mut graph, &edges);
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::mask_shape::MaskShape;

    #[test]
    fn links_overlapping_regions_of_adjacent_frames() {
        let frames = vec![
            vec![MaskShape::rect(0, 0, 10, 10, 0).unwrap()],
            vec![
                MaskShape::rect(2, 0, 10, 10, 0).unwrap(),
                MaskShape::rect(60, 60, 10, 10, 0).unwrap(),
            ],
        ];
        let graph = FrameGraphBuilder::new(100.0).build(frames).unwrap();

        let a = graph.frame(1)[0];
        let b = graph.frame(2)[0];
        let c = graph.frame(2)[1];
        assert_eq!(graph.node(a).overlap.next.len(), 1);
        assert_eq!(graph.node(a).overlap.next[0].node, b);
        assert_eq!(graph.node(a).overlap.next[0].weight, 80.0);
        assert!(graph.node(c).overlap.prev.is_empty());
        assert_eq!(graph.node(b).shape.frame(), 2);
    }

    #[test]
    fn distance_prefilter_drops_far_pairs() {
        // Overlapping but the centroids are 30 apart, beyond max_distance.
        let frames = vec![
            vec![MaskShape::rect(0, 0, 40, 10, 1).unwrap()],
            vec![MaskShape::rect(30, 0, 40, 10, 2).unwrap()],
        ];
        let graph = FrameGraphBuilder::new(20.0).build(frames).unwrap();
        assert!(graph.node(graph.frame(1)[0]).overlap.next.is_empty());
    }

    #[test]
    fn empty_frame_is_a_gap() {
        let frames = vec![
            vec![MaskShape::rect(0, 0, 10, 10, 1).unwrap()],
            Vec::new(),
            vec![MaskShape::rect(0, 0, 10, 10, 3).unwrap()],
        ];
        let graph = FrameGraphBuilder::new(100.0).build(frames).unwrap();
        assert_eq!(graph.frame_count(), 3);
        assert!(graph.frame(2).is_empty());
        assert!(graph.node(graph.frame(1)[0]).overlap.next.is_empty());
        assert!(graph.node(graph.frame(3)[0]).overlap.prev.is_empty());
    }
}
