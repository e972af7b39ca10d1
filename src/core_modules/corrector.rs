// THEORY:
// The `SegmentationCorrector` runs after each overlap matching pass and repairs
// the two classic segmentation errors while the frame pair is still open:
//
// 1.  **Undersegmentation** (two nuclei detected as one in frame f+1). A frame-f
//     node rejected by the matcher points at its best candidate `target`,
//     which is already matched to a `rival`. If the rejected node and the rival
//     together explain `target`'s area better than the rival alone, `target`
//     is a cluster of both. Each cluster is cut by the watershed collaborator,
//     seeded at the overlap of each parent with the cluster; every child is
//     matched to its own parent and replaces the cluster in frame f+1.
//
// 2.  **Oversegmentation or division** (one nucleus seen as two regions in
//     frame f+1). An unmatched frame-(f+1) node whose best prev candidate
//     `mother` is already matched to a `sister` is compared by area: the two
//     pieces must add up to the mother and be alike. Far apart pieces
//     (distance > 55 and > 1.2 x the smaller major axis) are two daughters of a
//     division and both start new trajectories. Otherwise the pieces are fused
//     back into a single node that continues the mother's trajectory.
//
// 3.  **Distance fallback**. Nodes still alone on both sides may be matched by
//     centroid distance with the same stable matching, using distance lists.
//
// Anything left unmatched in frame f+1 becomes a seed (a trajectory start).

use crate::core_modules::matcher::{MatchOutcome, StableMatcher};
use crate::core_modules::node::{MatchMode, NodeGraph, NodeId};
use crate::core_modules::region::RegionShape;
use crate::core_modules::watershed::{Marker, WatershedSplitter};
use crate::error::{TrackError, TrackResult};
use log::{debug, info};
use std::collections::HashSet;

/// Maximum relative area mismatch for two pieces to be one nucleus.
pub const AREA_TOLERANCE: f64 = 0.1;
/// Daughters of a division are at least this far apart.
pub const CYTOKINESIS_MIN_DISTANCE: f64 = 55.0;
/// ... and farther apart than this multiple of the smaller major axis.
pub const CYTOKINESIS_AXIS_RATIO: f64 = 1.2;

/// Counters for one corrected frame pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrectionReport {
    pub clusters_split: usize,
    pub split_children: usize,
    pub lineages_ended: usize,
    pub fusions: usize,
    pub divisions: usize,
    pub distance_matches: usize,
    pub new_seeds: usize,
}

impl CorrectionReport {
    pub fn merge(&mut self, other: &CorrectionReport) {
        self.clusters_split += other.clusters_split;
        self.split_children += other.split_children;
        self.lineages_ended += other.lineages_ended;
        self.fusions += other.fusions;
        self.divisions += other.divisions;
        self.distance_matches += other.distance_matches;
        self.new_seeds += other.new_seeds;
    }
}

/// How an unmatched next-frame node is explained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No compatible explanation: the node starts a new trajectory.
    Lone,
    /// The node and `sister` are the two daughters of `mother`.
    Division { mother: NodeId, sister: NodeId },
    /// The node and `sister` are two pieces of the nucleus that `mother` continues into.
    Oversegmented { mother: NodeId, sister: NodeId },
}

/// Detects and repairs segmentation errors of one frame pair.
#[derive(Debug, Clone)]
pub struct SegmentationCorrector {
    max_distance: f64,
    distance_fallback: bool,
}

impl SegmentationCorrector {
    pub fn new(max_distance: f64, distance_fallback: bool) -> Self {
        Self {
            max_distance,
            distance_fallback,
        }
    }

    /// Runs every correction for the frame pair whose overlap matching produced
    /// `outcome`. `next_all` is the frame-(f+1) node list as it was before the
    /// matching pass. New trajectory starts are appended to `seeds`.
    pub fn correct<S, W>(
        &self,
        graph: &mut NodeGraph<S>,
        outcome: MatchOutcome,
        next_all: &[NodeId],
        splitter: &mut W,
        seeds: &mut Vec<NodeId>,
    ) -> TrackResult<CorrectionReport>
    where
        S: RegionShape,
        W: WatershedSplitter<S>,
    {
        let mut report = CorrectionReport::default();
        let MatchOutcome {
            matched_next,
            mut rejected,
        } = outcome;

        // --- 1. Undersegmentation ---
        let clusters = self.detect_undersegmentation(graph, &mut rejected);
        for cluster in clusters {
            self.split_cluster(graph, cluster, splitter, &mut report)?;
        }

        // --- 2. Oversegmentation / cytokinesis ---
        let matched: HashSet<NodeId> = matched_next.into_iter().collect();
        let unmatched: Vec<NodeId> = next_all
            .iter()
            .copied()
            .filter(|id| !matched.contains(id))
            .collect();
        let lone = self.resolve_unmatched(graph, &unmatched, seeds, &mut report)?;

        // --- 3. Distance fallback ---
        let lone = if self.distance_fallback {
            let outcome = self.distance_fallback(graph, &rejected, &lone)?;
            report.distance_matches = outcome.matched_next.len();
            let matched: HashSet<NodeId> = outcome.matched_next.into_iter().collect();
            lone.into_iter().filter(|id| !matched.contains(id)).collect()
        } else {
            lone
        };
        report.new_seeds += lone.len();
        seeds.extend(lone);

        graph.check_links()?;
        Ok(report)
    }

    /// Moves every rejected node explained as part of an undersegmented cluster
    /// out of `rejected` and returns the clusters, each once, in detection order.
    pub fn detect_undersegmentation<S: RegionShape>(
        &self,
        graph: &mut NodeGraph<S>,
        rejected: &mut Vec<NodeId>,
    ) -> Vec<NodeId> {
        let mut clusters = Vec::new();
        let mut still_rejected = Vec::new();

        for &node in rejected.iter() {
            graph.sort_node(node, MatchMode::Overlap);
            let Some(target) = graph.node(node).overlap.next.first().map(|c| c.node) else {
                still_rejected.push(node);
                continue;
            };
            let Some(rival) = graph.node(target).best_prev() else {
                still_rejected.push(node);
                continue;
            };

            let target_area = graph.node(target).area;
            let rival_area = graph.node(rival).area;
            let combined = graph.node(node).area + rival_area;
            if (target_area - combined).abs() < (target_area - rival_area).abs() {
                debug!("{target:?} is a cluster of {node:?} and {rival:?}");
                graph.node_mut(target).cluster_of(&[node, rival]);
                if !clusters.contains(&target) {
                    clusters.push(target);
                }
            } else {
                still_rejected.push(node);
            }
        }

        *rejected = still_rejected;
        clusters
    }

    /// Cuts `cluster` with the watershed collaborator. Each child is matched to
    /// its parent and replaces the cluster in its frame. Returns the children.
    pub fn split_cluster<S, W>(
        &self,
        graph: &mut NodeGraph<S>,
        cluster: NodeId,
        splitter: &mut W,
        report: &mut CorrectionReport,
    ) -> TrackResult<Vec<NodeId>>
    where
        S: RegionShape,
        W: WatershedSplitter<S>,
    {
        let frame = graph.node(cluster).frame;
        let parents = graph.node(cluster).cluster.clone();
        let cluster_shape = graph.node(cluster).shape.clone();
        let markers: Vec<Marker> = parents
            .iter()
            .map(|&p| overlap_marker(&graph.node(p).shape, &cluster_shape))
            .collect();

        let shapes = splitter.split(frame, &markers, &cluster_shape)?;
        if shapes.len() != markers.len() {
            return Err(TrackError::MarkerCountMismatch {
                expected: markers.len(),
                got: shapes.len(),
            });
        }

        let prev_nodes: Vec<NodeId> = graph
            .node(cluster)
            .overlap
            .prev
            .iter()
            .map(|c| c.node)
            .collect();
        let next_nodes: Vec<NodeId> = graph
            .node(cluster)
            .overlap
            .next
            .iter()
            .map(|c| c.node)
            .collect();

        let mut children = Vec::new();
        for (shape, parent) in shapes.into_iter().zip(parents) {
            let Some(shape) = shape else {
                graph.node_mut(parent).overlap.best_next = None;
                report.lineages_ended += 1;
                info!("frame {frame}: watershed could not resolve the marker of {parent:?}, its lineage ends");
                continue;
            };

            let child = graph.create_node(frame, shape)?;
            for &prev in &prev_nodes {
                graph.test_overlap(prev, child);
            }
            for &next in &next_nodes {
                graph.test_overlap(child, next);
            }
            graph.sort_node(child, MatchMode::Overlap);

            let rank = graph.node(child).rank_of(parent, MatchMode::Overlap);
            let links = &mut graph.node_mut(child).overlap;
            links.best_prev = Some(parent);
            links.best_prev_rank = rank;
            graph.node_mut(parent).overlap.best_next = Some(child);
            children.push(child);
        }

        for &prev in &prev_nodes {
            graph.remove_next_candidate(prev, cluster);
            graph.sort_node(prev, MatchMode::Overlap);
        }
        for &next in &next_nodes {
            graph.remove_prev_candidate(next, cluster);
            graph.sort_node(next, MatchMode::Overlap);
        }

        // A parent without a child may still point at the cluster.
        let stale: Vec<NodeId> = prev_nodes
            .iter()
            .copied()
            .filter(|&p| graph.node(p).best_next() == Some(cluster))
            .collect();
        for p in stale {
            graph.node_mut(p).overlap.best_next = None;
        }

        graph.retire(cluster, &children);
        for &child in &children {
            graph.insert_into_frame(frame, child);
        }

        debug!("frame {frame}: {cluster:?} split into {children:?}");
        report.clusters_split += 1;
        report.split_children += children.len();
        Ok(children)
    }

    /// Decides what an unmatched next-frame node is, without touching the graph.
    pub fn classify<S: RegionShape>(&self, graph: &NodeGraph<S>, node: NodeId) -> Verdict {
        let n = graph.node(node);
        let Some(mother) = n.overlap.prev.first().map(|c| c.node) else {
            return Verdict::Lone;
        };
        let m = graph.node(mother);
        let Some(sister) = m.best_next() else {
            return Verdict::Lone;
        };
        if sister == node || m.retired {
            return Verdict::Lone;
        }
        let s = graph.node(sister);

        let combined = n.area + s.area;
        let sums_to_mother = (m.area - combined).abs() < AREA_TOLERANCE * m.area;
        let alike = (s.area - n.area).abs() < AREA_TOLERANCE * s.area;
        if !(sums_to_mother && alike) {
            return Verdict::Lone;
        }

        let distance = n.distance_to(s);
        let axis = n.major_axis.min(s.major_axis);
        if distance > CYTOKINESIS_MIN_DISTANCE && distance > CYTOKINESIS_AXIS_RATIO * axis {
            Verdict::Division { mother, sister }
        } else {
            Verdict::Oversegmented { mother, sister }
        }
    }

    /// Applies `classify` to every unmatched next-frame node. Daughters of a
    /// division are appended to `seeds`; returns the nodes left alone.
    pub fn resolve_unmatched<S: RegionShape>(
        &self,
        graph: &mut NodeGraph<S>,
        unmatched: &[NodeId],
        seeds: &mut Vec<NodeId>,
        report: &mut CorrectionReport,
    ) -> TrackResult<Vec<NodeId>> {
        let mut lone = Vec::new();

        for &node in unmatched {
            if graph.node(node).retired {
                continue;
            }
            graph.sort_node(node, MatchMode::Overlap);

            match self.classify(graph, node) {
                Verdict::Lone => lone.push(node),
                Verdict::Division { mother, sister } => {
                    debug!("{mother:?} divides into {node:?} and {sister:?}");
                    graph.node_mut(mother).overlap.best_next = None;
                    let sister_links = &mut graph.node_mut(sister).overlap;
                    sister_links.best_prev = None;
                    sister_links.best_prev_rank = None;
                    graph.node_mut(node).mother = Some(mother);
                    graph.node_mut(sister).mother = Some(mother);
                    seeds.push(node);
                    seeds.push(sister);
                    report.divisions += 1;
                    report.new_seeds += 2;
                }
                Verdict::Oversegmented { mother, sister } => {
                    let fused = self.fuse(graph, node, sister)?;
                    let rank = graph.node(fused).rank_of(mother, MatchMode::Overlap);
                    let links = &mut graph.node_mut(fused).overlap;
                    links.best_prev = Some(mother);
                    links.best_prev_rank = rank;
                    graph.node_mut(mother).overlap.best_next = Some(fused);
                    debug!("{node:?} and {sister:?} fused into {fused:?}, continuing {mother:?}");
                    report.fusions += 1;
                }
            }
        }

        Ok(lone)
    }

    /// Replaces `a` and `b` by a single node holding the union of their shapes.
    /// Candidate edges of both are re-tested against the fused shape and stale
    /// edges are dropped. The fused node has no partner yet.
    pub fn fuse<S: RegionShape>(
        &self,
        graph: &mut NodeGraph<S>,
        a: NodeId,
        b: NodeId,
    ) -> TrackResult<NodeId> {
        let frame = graph.node(a).frame;
        let shape = graph
            .node(a)
            .shape
            .union(&graph.node(b).shape)
            .ok_or_else(|| TrackError::InvalidShape {
                frame,
                index: a.0,
                reason: "union of two regions is empty".to_string(),
            })?;
        let fused = graph.create_node(frame, shape)?;

        let next_nodes = combined_candidates(graph, a, b, Side::Next);
        for next in next_nodes {
            graph.test_overlap(fused, next);
            graph.remove_prev_candidate(next, a);
            graph.remove_prev_candidate(next, b);
            graph.sort_node(next, MatchMode::Overlap);
        }

        let prev_nodes = combined_candidates(graph, a, b, Side::Prev);
        for prev in prev_nodes {
            graph.test_overlap(prev, fused);
            graph.remove_next_candidate(prev, a);
            graph.remove_next_candidate(prev, b);
            graph.sort_node(prev, MatchMode::Overlap);
        }
        graph.sort_node(fused, MatchMode::Overlap);

        graph.retire(a, &[fused]);
        graph.retire(b, &[fused]);
        graph.insert_into_frame(frame, fused);
        Ok(fused)
    }

    /// Matches the still-rejected frame-f nodes with the lone frame-(f+1) nodes
    /// by centroid distance. Nodes that already have a partner are left out,
    /// so a second run over the same pair changes nothing.
    pub fn distance_fallback<S: RegionShape>(
        &self,
        graph: &mut NodeGraph<S>,
        rejected: &[NodeId],
        lone: &[NodeId],
    ) -> TrackResult<MatchOutcome> {
        let remaining: Vec<NodeId> = rejected
            .iter()
            .copied()
            .filter(|&id| !graph.node(id).retired && graph.node(id).best_next().is_none())
            .collect();
        let next_all: Vec<NodeId> = lone
            .iter()
            .copied()
            .filter(|&id| !graph.node(id).retired && graph.node(id).best_prev().is_none())
            .collect();
        if remaining.is_empty() || next_all.is_empty() {
            return Ok(MatchOutcome {
                matched_next: Vec::new(),
                rejected: remaining,
            });
        }

        for &next in &next_all {
            for &prev in &remaining {
                let distance = graph.node(prev).distance_to(graph.node(next));
                if distance < self.max_distance {
                    graph.link_by_distance(prev, next, distance);
                }
            }
        }
        for &id in remaining.iter().chain(next_all.iter()) {
            graph.sort_node(id, MatchMode::Distance);
        }

        let outcome = StableMatcher::new(MatchMode::Distance).run(graph, remaining)?;
        for &next in &outcome.matched_next {
            debug!("{next:?} matched by distance to {:?}", graph.node(next).best_prev());
        }
        Ok(outcome)
    }
}

/// Centroid of the overlap between a parent and the cluster, truncated to a pixel.
/// Falls back to the parent's own centroid when the two no longer overlap.
fn overlap_marker<S: RegionShape>(parent: &S, cluster: &S) -> Marker {
    let (x, y) = parent
        .intersect(cluster)
        .map(|overlap| overlap.centroid())
        .unwrap_or_else(|| parent.centroid());
    (x.max(0.0) as u32, y.max(0.0) as u32)
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Prev,
    Next,
}

/// Union of two nodes' overlap candidates on one side, first-seen order, without `a` and `b`.
fn combined_candidates<S: RegionShape>(graph: &NodeGraph<S>, a: NodeId, b: NodeId, side: Side) -> Vec<NodeId> {
    let mut combined = Vec::new();
    for id in [a, b] {
        let links = &graph.node(id).overlap;
        let list = match side {
            Side::Prev => &links.prev,
            Side::Next => &links.next,
        };
        for candidate in list {
            if candidate.node != a && candidate.node != b && !combined.contains(&candidate.node) {
                combined.push(candidate.node);
            }
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame_graph::FrameGraphBuilder;
    use crate::core_modules::mask_shape::MaskShape;
    use crate::core_modules::watershed::MarkerWatershed;

    /// Returns a fixed answer regardless of the markers.
    struct ScriptedSplitter {
        answer: Vec<Option<MaskShape>>,
    }

    impl WatershedSplitter<MaskShape> for ScriptedSplitter {
        fn split(
            &mut self,
            _frame: usize,
            _markers: &[Marker],
            _cluster: &MaskShape,
        ) -> TrackResult<Vec<Option<MaskShape>>> {
            Ok(self.answer.clone())
        }
    }

    fn disk(cx: f64, cy: f64, r: f64) -> MaskShape {
        MaskShape::disk(cx, cy, r, 0).unwrap()
    }

    fn matched_pair(frames: Vec<Vec<MaskShape>>) -> (NodeGraph<MaskShape>, MatchOutcome, Vec<NodeId>) {
        let mut graph = FrameGraphBuilder::new(100.0).build(frames).unwrap();
        graph.sort_frame(1, MatchMode::Overlap);
        graph.sort_frame(2, MatchMode::Overlap);
        let remaining = graph.frame(1).to_vec();
        let next_all = graph.frame(2).to_vec();
        let outcome = StableMatcher::new(MatchMode::Overlap)
            .run(&mut graph, remaining)
            .unwrap();
        (graph, outcome, next_all)
    }

    fn undersegmented_pair() -> (NodeGraph<MaskShape>, MatchOutcome, Vec<NodeId>) {
        let merged = disk(21.0, 20.0, 10.0).union(&disk(39.0, 20.0, 10.0)).unwrap();
        matched_pair(vec![
            vec![disk(20.0, 20.0, 8.0), disk(40.0, 20.0, 8.0)],
            vec![merged],
        ])
    }

    #[test]
    fn detects_undersegmented_cluster() {
        let (mut graph, mut outcome, next_all) = undersegmented_pair();
        assert_eq!(outcome.rejected.len(), 1);

        let corrector = SegmentationCorrector::new(100.0, true);
        let clusters = corrector.detect_undersegmentation(&mut graph, &mut outcome.rejected);

        assert_eq!(clusters, next_all);
        assert!(outcome.rejected.is_empty());
        assert_eq!(graph.node(clusters[0]).cluster.len(), 2);
    }

    #[test]
    fn split_gives_each_parent_its_own_child() {
        let (mut graph, outcome, next_all) = undersegmented_pair();
        let parents = graph.frame(1).to_vec();
        let mut seeds = parents.clone();
        let mut splitter = MarkerWatershed::new(2.0);

        let report = SegmentationCorrector::new(100.0, true)
            .correct(&mut graph, outcome, &next_all, &mut splitter, &mut seeds)
            .unwrap();

        assert_eq!(report.clusters_split, 1);
        assert_eq!(report.split_children, 2);
        assert!(graph.node(next_all[0]).retired);
        assert_eq!(graph.frame(2).len(), 2);

        let children: Vec<NodeId> = parents
            .iter()
            .map(|&p| graph.node(p).best_next().unwrap())
            .collect();
        assert_ne!(children[0], children[1]);
        for (&parent, &child) in parents.iter().zip(&children) {
            assert_eq!(graph.node(child).best_prev(), Some(parent));
            assert!((graph.node(child).centroid.0 - graph.node(parent).centroid.0).abs() < 5.0);
        }
        // Children are recorded in cluster member order.
        let by_member: Vec<NodeId> = graph
            .node(next_all[0])
            .cluster
            .iter()
            .map(|&p| graph.node(p).best_next().unwrap())
            .collect();
        assert_eq!(graph.node(next_all[0]).replaced_by, by_member);
        assert_eq!(seeds, parents);
        graph.check_links().unwrap();
    }

    #[test]
    fn unresolved_marker_ends_the_lineage() {
        let (mut graph, mut outcome, _) = undersegmented_pair();
        let corrector = SegmentationCorrector::new(100.0, true);
        let clusters = corrector.detect_undersegmentation(&mut graph, &mut outcome.rejected);
        let parents = graph.node(clusters[0]).cluster.clone();

        let mut splitter = ScriptedSplitter {
            answer: vec![Some(disk(21.0, 20.0, 9.0)), None],
        };
        let mut report = CorrectionReport::default();
        let children = corrector
            .split_cluster(&mut graph, clusters[0], &mut splitter, &mut report)
            .unwrap();

        assert_eq!(children.len(), 1);
        assert_eq!(report.lineages_ended, 1);
        assert_eq!(graph.node(parents[0]).best_next(), Some(children[0]));
        assert_eq!(graph.node(parents[1]).best_next(), None);
        graph.check_links().unwrap();
    }

    #[test]
    fn splitter_breaking_its_contract_is_fatal() {
        let (mut graph, mut outcome, _) = undersegmented_pair();
        let corrector = SegmentationCorrector::new(100.0, true);
        let clusters = corrector.detect_undersegmentation(&mut graph, &mut outcome.rejected);

        let mut splitter = ScriptedSplitter { answer: Vec::new() };
        let err = corrector
            .split_cluster(&mut graph, clusters[0], &mut splitter, &mut CorrectionReport::default())
            .unwrap_err();
        assert!(matches!(err, TrackError::MarkerCountMismatch { expected: 2, got: 0 }));
    }

    #[test]
    fn fused_area_equals_union_area() {
        let mut graph = NodeGraph::new();
        let mother = graph.add_node(1, MaskShape::rect(0, 0, 20, 10, 1).unwrap()).unwrap();
        let a = graph.add_node(2, MaskShape::rect(0, 0, 10, 10, 2).unwrap()).unwrap();
        let b = graph.add_node(2, MaskShape::rect(8, 0, 10, 10, 2).unwrap()).unwrap();
        graph.test_overlap(mother, a);
        graph.test_overlap(mother, b);

        let union_area = graph.node(a).shape.union(&graph.node(b).shape).unwrap().area();
        let fused = SegmentationCorrector::new(100.0, true)
            .fuse(&mut graph, a, b)
            .unwrap();

        assert!((graph.node(fused).area - union_area).abs() < 1e-9);
        assert_eq!(graph.frame(2), &[fused]);
        let next: Vec<NodeId> = graph.node(mother).overlap.next.iter().map(|c| c.node).collect();
        assert_eq!(next, vec![fused]);
        assert_eq!(graph.node(fused).overlap.prev[0].node, mother);
        assert!(graph.node(a).retired && graph.node(b).retired);
    }

    #[test]
    fn candidate_lists_stay_sorted_after_build_and_fuse() {
        let mut graph = FrameGraphBuilder::new(100.0)
            .build(vec![
                vec![MaskShape::rect(0, 0, 20, 10, 1).unwrap()],
                vec![
                    MaskShape::rect(0, 0, 10, 10, 2).unwrap(),
                    MaskShape::rect(10, 0, 10, 10, 2).unwrap(),
                    MaskShape::rect(30, 0, 10, 10, 2).unwrap(),
                ],
                vec![MaskShape::rect(5, 0, 30, 10, 3).unwrap()],
            ])
            .unwrap();
        for frame in 1..=3 {
            graph.sort_frame(frame, MatchMode::Overlap);
        }
        for frame in 1..=3 {
            assert!(graph.check_sorted(frame, MatchMode::Overlap), "frame {frame} after build");
        }

        let (a, b) = (graph.frame(2)[0], graph.frame(2)[1]);
        let fused = SegmentationCorrector::new(100.0, true)
            .fuse(&mut graph, a, b)
            .unwrap();

        for frame in 1..=3 {
            assert!(graph.check_sorted(frame, MatchMode::Overlap), "frame {frame} after fuse");
        }
        let last = graph.frame(3)[0];
        assert_eq!(graph.node(last).overlap.prev[0].node, fused);
    }

    /// Mother in frame 1 already matched to `a`; `b` is the unmatched piece.
    fn two_pieces(mother: MaskShape, a: MaskShape, b: MaskShape) -> (NodeGraph<MaskShape>, NodeId) {
        let mut graph = NodeGraph::new();
        let mother = graph.add_node(1, mother).unwrap();
        let a = graph.add_node(2, a).unwrap();
        let b = graph.add_node(2, b).unwrap();
        graph.test_overlap(mother, a).unwrap();
        graph.test_overlap(mother, b).unwrap();
        graph.node_mut(mother).overlap.best_next = Some(a);
        graph.node_mut(a).overlap.best_prev = Some(mother);
        (graph, b)
    }

    #[test]
    fn distant_pieces_shorter_than_their_axes_are_fused() {
        // 100 px apart, but each piece is about 115 px long.
        let (graph, b) = two_pieces(
            MaskShape::rect(0, 0, 200, 2, 1).unwrap(),
            MaskShape::rect(0, 0, 100, 2, 2).unwrap(),
            MaskShape::rect(100, 0, 100, 2, 2).unwrap(),
        );
        let n = graph.node(b);
        let distance = n.distance_to(graph.node(graph.frame(2)[0]));
        assert!(distance > CYTOKINESIS_MIN_DISTANCE);
        assert!(distance <= CYTOKINESIS_AXIS_RATIO * n.major_axis);

        let verdict = SegmentationCorrector::new(100.0, true).classify(&graph, b);
        assert!(matches!(verdict, Verdict::Oversegmented { .. }));
    }

    #[test]
    fn far_apart_compact_pieces_are_a_division() {
        // Centroids 80 px apart, major axes close to 50 px.
        let (graph, b) = two_pieces(
            MaskShape::rect(0, 0, 123, 3, 1).unwrap(),
            MaskShape::rect(0, 0, 43, 4, 2).unwrap(),
            MaskShape::rect(80, 0, 43, 4, 2).unwrap(),
        );
        let a = graph.frame(2)[0];
        let n = graph.node(b);
        assert!((n.distance_to(graph.node(a)) - 80.0).abs() < 1e-9);
        assert!((n.major_axis - 50.0).abs() < 1.0);

        let verdict = SegmentationCorrector::new(100.0, true).classify(&graph, b);
        assert_eq!(
            verdict,
            Verdict::Division {
                mother: graph.frame(1)[0],
                sister: a
            }
        );
    }

    #[test]
    fn unequal_pieces_stay_lone() {
        // The pieces add up to the mother but are not alike.
        let (graph, outcome, next_all) = matched_pair(vec![
            vec![MaskShape::rect(0, 0, 20, 10, 1).unwrap()],
            vec![
                MaskShape::rect(0, 0, 14, 10, 2).unwrap(),
                MaskShape::rect(14, 0, 6, 10, 2).unwrap(),
            ],
        ]);
        let unmatched: Vec<NodeId> = next_all
            .iter()
            .copied()
            .filter(|id| !outcome.matched_next.contains(id))
            .collect();
        let verdict = SegmentationCorrector::new(100.0, true).classify(&graph, unmatched[0]);
        assert_eq!(verdict, Verdict::Lone);
    }

    #[test]
    fn distance_fallback_is_idempotent_on_matched_pairs() {
        let (mut graph, outcome, _) = matched_pair(vec![
            vec![MaskShape::rect(0, 0, 10, 10, 1).unwrap()],
            vec![MaskShape::rect(1, 0, 10, 10, 2).unwrap()],
        ]);
        let matched = outcome.matched_next.clone();
        let corrector = SegmentationCorrector::new(100.0, true);
        let before = format!("{:?}", graph.nodes().collect::<Vec<_>>());

        let frame1 = graph.frame(1).to_vec();
        for _ in 0..2 {
            let outcome = corrector
                .distance_fallback(&mut graph, &frame1, &matched)
                .unwrap();
            assert!(outcome.matched_next.is_empty());
        }

        let after = format!("{:?}", graph.nodes().collect::<Vec<_>>());
        assert_eq!(before, after);
    }

    #[test]
    fn distance_fallback_matches_nearby_lone_nodes() {
        let mut graph = FrameGraphBuilder::new(100.0)
            .build(vec![
                vec![MaskShape::rect(0, 0, 10, 10, 1).unwrap()],
                vec![MaskShape::rect(30, 0, 10, 10, 2).unwrap()],
            ])
            .unwrap();
        let prev = graph.frame(1)[0];
        let next = graph.frame(2)[0];
        let corrector = SegmentationCorrector::new(100.0, true);

        let outcome = corrector
            .distance_fallback(&mut graph, &[prev], &[next])
            .unwrap();

        assert_eq!(outcome.matched_next, vec![next]);
        assert_eq!(graph.node(prev).best_next(), Some(next));
        assert_eq!(graph.node(next).best_prev(), Some(prev));
        assert_eq!(graph.node(next).distance.best_prev, Some(prev));
        graph.check_links().unwrap();
    }
}
