// THEORY:
// The `node` module holds the tracking graph. Every detected region of every
// frame becomes a `Node`, and nodes in adjacent frames reference each other
// through weighted candidate edges and through the `best_prev`/`best_next`
// pairing produced by stable matching.
//
// Those references form cycles (A.best_next = B, B.best_prev = A, both lists
// pointing back at each other), so the graph is an arena: all nodes live in a
// single `Vec` owned by `NodeGraph` and refer to each other by `NodeId`. A
// node is never removed from the arena. When a correction replaces a node
// (split or fuse) the node is `retired`: it leaves its frame list, its links
// are cleared, and `replaced_by` records which nodes took its place.
//
// Link invariant: for every active node A, `A.best_next == Some(B)` implies
// `B.best_prev == Some(A)` and vice versa. `check_links` verifies it.

use crate::core_modules::region::{RegionShape, centroid_distance};
use crate::error::{TrackError, TrackResult};
use log::warn;

/// Stable index of a node inside its `NodeGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// A weighted edge towards a node of an adjacent frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub weight: f64,
    pub node: NodeId,
}

/// Which preference lists a matching pass reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Overlap-area candidates, larger overlap is better.
    Overlap,
    /// Centroid-distance candidates, shorter distance is better.
    Distance,
}

/// Declared order of a candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrder {
    Descending,
    Ascending,
}

impl MatchMode {
    pub fn order(self) -> CandidateOrder {
        match self {
            MatchMode::Overlap => CandidateOrder::Descending,
            MatchMode::Distance => CandidateOrder::Ascending,
        }
    }
}

/// Per-mode match state of a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Links {
    pub prev: Vec<Candidate>,
    pub next: Vec<Candidate>,
    pub best_prev: Option<NodeId>,
    /// Rank of `best_prev` within `prev`.
    pub best_prev_rank: Option<usize>,
    pub best_next: Option<NodeId>,
}

/// One detected region in one frame.
#[derive(Debug, Clone)]
pub struct Node<S> {
    pub id: NodeId,
    /// 1-based frame index.
    pub frame: usize,
    pub shape: S,
    pub area: f64,
    pub centroid: (f64, f64),
    pub major_axis: f64,

    // --- Matching ---
    /// Overlap candidates and the general match fields.
    pub overlap: Links,
    /// Distance candidates of the fallback pass. Its `best_prev`/`best_next`
    /// are mirrored into `overlap` once a distance match is made.
    pub distance: Links,

    // --- Correction ---
    /// Parent nodes whose union this node is believed to be (undersegmentation).
    pub cluster: Vec<NodeId>,
    /// Set on both daughters when a division is recognised.
    pub mother: Option<NodeId>,
    /// Nodes that took this node's place after a split or a fuse.
    pub replaced_by: Vec<NodeId>,
    /// Retired nodes are no longer part of any frame.
    pub retired: bool,
}

impl<S: RegionShape> Node<S> {
    fn new(id: NodeId, frame: usize, shape: S) -> Self {
        Self {
            id,
            frame,
            area: shape.area(),
            centroid: shape.centroid(),
            major_axis: shape.major_axis_length(),
            shape,
            overlap: Links::default(),
            distance: Links::default(),
            cluster: Vec::new(),
            mother: None,
            replaced_by: Vec::new(),
            retired: false,
        }
    }

    pub fn links(&self, mode: MatchMode) -> &Links {
        match mode {
            MatchMode::Overlap => &self.overlap,
            MatchMode::Distance => &self.distance,
        }
    }

    pub fn links_mut(&mut self, mode: MatchMode) -> &mut Links {
        match mode {
            MatchMode::Overlap => &mut self.overlap,
            MatchMode::Distance => &mut self.distance,
        }
    }

    pub fn best_prev(&self) -> Option<NodeId> {
        self.overlap.best_prev
    }

    pub fn best_next(&self) -> Option<NodeId> {
        self.overlap.best_next
    }

    /// Position of `node` in this node's prev list for `mode`.
    pub fn rank_of(&self, node: NodeId, mode: MatchMode) -> Option<usize> {
        self.links(mode).prev.iter().position(|c| c.node == node)
    }

    /// Adds `members` to the cluster, each at most once.
    pub fn cluster_of(&mut self, members: &[NodeId]) {
        for &member in members {
            if !self.cluster.contains(&member) {
                self.cluster.push(member);
            }
        }
    }

    pub fn distance_to(&self, other: &Node<S>) -> f64 {
        centroid_distance(self.centroid, other.centroid)
    }
}

/// Sorts a candidate list into its declared order. The sort is stable, so
/// equal weights keep their insertion order.
pub fn sort_candidates(list: &mut [Candidate], order: CandidateOrder) {
    match order {
        CandidateOrder::Descending => list.sort_by(|a, b| b.weight.total_cmp(&a.weight)),
        CandidateOrder::Ascending => list.sort_by(|a, b| a.weight.total_cmp(&b.weight)),
    }
}

fn is_sorted(list: &[Candidate], order: CandidateOrder) -> bool {
    list.windows(2).all(|w| match order {
        CandidateOrder::Descending => w[0].weight >= w[1].weight,
        CandidateOrder::Ascending => w[0].weight <= w[1].weight,
    })
}

/// Arena of nodes plus the active node list of every frame.
#[derive(Debug, Clone)]
pub struct NodeGraph<S> {
    nodes: Vec<Node<S>>,
    /// `frames[f - 1]` lists the active nodes of frame `f`.
    frames: Vec<Vec<NodeId>>,
}

impl<S: RegionShape> NodeGraph<S> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// Number of frames known to the graph.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Total number of nodes ever created, retired ones included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node<S> {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node<S> {
        &mut self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node<S>> {
        self.nodes.iter()
    }

    /// Active nodes of the 1-based `frame`. Unknown frames are empty.
    pub fn frame(&self, frame: usize) -> &[NodeId] {
        frame
            .checked_sub(1)
            .and_then(|i| self.frames.get(i))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Appends an empty frame and returns its 1-based index.
    pub fn push_frame(&mut self) -> usize {
        self.frames.push(Vec::new());
        self.frames.len()
    }

    fn frame_list_mut(&mut self, frame: usize) -> &mut Vec<NodeId> {
        while self.frames.len() < frame {
            self.frames.push(Vec::new());
        }
        &mut self.frames[frame - 1]
    }

    /// Creates a node from `shape` without placing it in any frame list.
    pub fn create_node(&mut self, frame: usize, mut shape: S) -> TrackResult<NodeId> {
        shape.set_frame(frame);
        let id = NodeId(self.nodes.len());
        let node = Node::new(id, frame, shape);
        if !node.area.is_finite() || node.area <= 0.0 {
            return Err(TrackError::InvalidShape {
                frame,
                index: id.0,
                reason: format!("area {} is not a positive number", node.area),
            });
        }
        if !node.centroid.0.is_finite() || !node.centroid.1.is_finite() {
            return Err(TrackError::InvalidShape {
                frame,
                index: id.0,
                reason: "centroid is not finite".to_string(),
            });
        }
        self.nodes.push(node);
        Ok(id)
    }

    /// Creates a node and appends it to its frame list.
    pub fn add_node(&mut self, frame: usize, shape: S) -> TrackResult<NodeId> {
        let id = self.create_node(frame, shape)?;
        self.frame_list_mut(frame).push(id);
        Ok(id)
    }

    pub fn insert_into_frame(&mut self, frame: usize, id: NodeId) {
        let list = self.frame_list_mut(frame);
        if !list.contains(&id) {
            list.push(id);
        }
    }

    pub fn remove_from_frame(&mut self, frame: usize, id: NodeId) {
        self.frame_list_mut(frame).retain(|&n| n != id);
    }

    /// Links `prev` and `next` with an overlap candidate if their shapes intersect.
    /// Returns the overlap area when a link was made.
    pub fn test_overlap(&mut self, prev: NodeId, next: NodeId) -> Option<f64> {
        let overlap = self
            .node(prev)
            .shape
            .intersect(&self.node(next).shape)
            .map(|s| s.area())?;
        if overlap <= 0.0 {
            return None;
        }
        self.link(prev, next, overlap, MatchMode::Overlap);
        Some(overlap)
    }

    /// Adds a candidate at both ends of the edge.
    pub fn link(&mut self, prev: NodeId, next: NodeId, weight: f64, mode: MatchMode) {
        self.node_mut(prev)
            .links_mut(mode)
            .next
            .push(Candidate { weight, node: next });
        self.node_mut(next)
            .links_mut(mode)
            .prev
            .push(Candidate { weight, node: prev });
    }

    /// Adds a distance candidate unless the pair is already linked by distance.
    pub fn link_by_distance(&mut self, prev: NodeId, next: NodeId, distance: f64) -> bool {
        let already = self
            .node(next)
            .distance
            .prev
            .iter()
            .any(|c| c.node == prev);
        if already {
            return false;
        }
        if !distance.is_finite() {
            warn!("skipping distance candidate {prev:?} -> {next:?} with weight {distance}");
            return false;
        }
        self.link(prev, next, distance, MatchMode::Distance);
        true
    }

    pub fn remove_prev_candidate(&mut self, node: NodeId, stale: NodeId) {
        let prev = &mut self.node_mut(node).overlap.prev;
        if let Some(i) = prev.iter().position(|c| c.node == stale) {
            prev.remove(i);
        }
    }

    pub fn remove_next_candidate(&mut self, node: NodeId, stale: NodeId) {
        let next = &mut self.node_mut(node).overlap.next;
        if let Some(i) = next.iter().position(|c| c.node == stale) {
            next.remove(i);
        }
    }

    /// Sorts both candidate lists of `node` for `mode`.
    pub fn sort_node(&mut self, node: NodeId, mode: MatchMode) {
        let order = mode.order();
        let links = self.node_mut(node).links_mut(mode);
        sort_candidates(&mut links.prev, order);
        sort_candidates(&mut links.next, order);
    }

    /// Sorts every node of the 1-based `frame` for `mode`.
    pub fn sort_frame(&mut self, frame: usize, mode: MatchMode) {
        let ids = self.frame(frame).to_vec();
        for id in ids {
            self.sort_node(id, mode);
        }
    }

    /// Takes `node` out of the active graph: it leaves its frame, its match
    /// links are cleared, and `replaced_by` records its successors.
    pub fn retire(&mut self, node: NodeId, replaced_by: &[NodeId]) {
        let frame = self.node(node).frame;
        self.remove_from_frame(frame, node);
        let n = self.node_mut(node);
        n.retired = true;
        n.replaced_by = replaced_by.to_vec();
        n.overlap.best_prev = None;
        n.overlap.best_prev_rank = None;
        n.overlap.best_next = None;
        n.distance.best_prev = None;
        n.distance.best_prev_rank = None;
        n.distance.best_next = None;
    }

    /// Verifies that `best_next`/`best_prev` mirror each other on every active node,
    /// and never point at a retired node.
    pub fn check_links(&self) -> TrackResult<()> {
        for node in self.nodes.iter().filter(|n| !n.retired) {
            if let Some(next) = node.overlap.best_next {
                let other = self.node(next);
                if other.retired {
                    return Err(TrackError::BrokenLink {
                        from: node.id.0,
                        to: next.0,
                        reason: "best_next points at a retired node",
                    });
                }
                if other.overlap.best_prev != Some(node.id) {
                    return Err(TrackError::BrokenLink {
                        from: node.id.0,
                        to: next.0,
                        reason: "best_next is not mirrored by best_prev",
                    });
                }
            }
            if let Some(prev) = node.overlap.best_prev {
                let other = self.node(prev);
                if other.overlap.best_next != Some(node.id) {
                    return Err(TrackError::BrokenLink {
                        from: prev.0,
                        to: node.id.0,
                        reason: "best_prev is not mirrored by best_next",
                    });
                }
            }
        }
        Ok(())
    }

    /// True when every candidate list of `mode` in `frame` follows its declared order.
    pub fn check_sorted(&self, frame: usize, mode: MatchMode) -> bool {
        let order = mode.order();
        self.frame(frame).iter().all(|&id| {
            let links = self.node(id).links(mode);
            is_sorted(&links.prev, order) && is_sorted(&links.next, order)
        })
    }
}

impl<S: RegionShape> Default for NodeGraph<S> {
    fn default() -> Self {
        Self::new()
    }
}
