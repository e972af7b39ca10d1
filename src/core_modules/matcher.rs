// THEORY:
// The `StableMatcher` pairs the nodes of frame f with the nodes of frame f+1.
// It is a proposal-based stable matching (Gale-Shapley flavoured) where only
// the frame-f side proposes:
// 1.  A node is taken from the queue of unmatched nodes and walks its next
//     candidates from best to worst.
// 2.  A candidate without a partner is claimed outright.
// 3.  A candidate that already has a partner compares the two suitors by their
//     position in its own prev list. A better-ranked proposer steals it and
//     the evicted partner goes back to the end of the queue.
// 4.  A node turned down by all of its candidates is rejected.
// The loop ends when the queue is empty. Every steal strictly improves the rank
// of some next-frame partner, so the loop terminates. Rank ties cannot happen
// because a rank is a list position.
//
// The two mutations (claim and steal) are explicit transitions that check the
// link invariant before and after. In distance mode the general match fields
// are updated alongside the distance ones so the rest of the tracker only ever
// reads `best_prev`/`best_next`.

use crate::core_modules::node::{MatchMode, NodeGraph, NodeId};
use crate::core_modules::region::RegionShape;
use crate::error::{TrackError, TrackResult};
use log::{debug, warn};
use std::collections::VecDeque;

/// Result of one matching pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    /// Next-frame nodes that received a partner, in the order they were first claimed.
    pub matched_next: Vec<NodeId>,
    /// Current-frame nodes turned down by all of their candidates.
    pub rejected: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Proposal {
    Claimed(NodeId),
    Stole { evicted: NodeId },
    Rejected,
}

/// Proposal-based stable matching over one kind of candidate list.
#[derive(Debug, Clone, Copy)]
pub struct StableMatcher {
    mode: MatchMode,
}

impl StableMatcher {
    pub fn new(mode: MatchMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Matches `remaining` against their next candidates. Candidate lists must
    /// already be sorted for this matcher's mode.
    pub fn run<S: RegionShape>(
        &self,
        graph: &mut NodeGraph<S>,
        remaining: Vec<NodeId>,
    ) -> TrackResult<MatchOutcome> {
        let mut queue: VecDeque<NodeId> = remaining.into();
        let mut outcome = MatchOutcome::default();

        while let Some(node) = queue.pop_front() {
            match self.propose(graph, node)? {
                Proposal::Claimed(next) => outcome.matched_next.push(next),
                Proposal::Stole { evicted } => queue.push_back(evicted),
                Proposal::Rejected => outcome.rejected.push(node),
            }
        }

        Ok(outcome)
    }

    fn propose<S: RegionShape>(
        &self,
        graph: &mut NodeGraph<S>,
        proposer: NodeId,
    ) -> TrackResult<Proposal> {
        let candidates: Vec<NodeId> = graph
            .node(proposer)
            .links(self.mode)
            .next
            .iter()
            .map(|c| c.node)
            .collect();

        for candidate in candidates {
            let target = graph.node(candidate);
            if target.retired {
                continue;
            }
            let Some(my_rank) = target.rank_of(proposer, self.mode) else {
                warn!("{candidate:?} does not list {proposer:?} among its prev candidates");
                continue;
            };

            let links = target.links(self.mode);
            let (best_prev, best_prev_rank) = (links.best_prev, links.best_prev_rank);
            match best_prev {
                None => {
                    self.claim(graph, proposer, candidate, my_rank)?;
                    return Ok(Proposal::Claimed(candidate));
                }
                Some(incumbent) => {
                    let incumbent_rank = best_prev_rank.unwrap_or(usize::MAX);
                    if my_rank < incumbent_rank {
                        self.steal(graph, proposer, candidate, incumbent, my_rank)?;
                        return Ok(Proposal::Stole { evicted: incumbent });
                    }
                }
            }
        }

        Ok(Proposal::Rejected)
    }

    /// `proposer` takes the free `candidate`.
    fn claim<S: RegionShape>(
        &self,
        graph: &mut NodeGraph<S>,
        proposer: NodeId,
        candidate: NodeId,
        rank: usize,
    ) -> TrackResult<()> {
        if graph.node(candidate).links(self.mode).best_prev.is_some() {
            return Err(TrackError::BrokenLink {
                from: proposer.0,
                to: candidate.0,
                reason: "claimed candidate already has a partner",
            });
        }

        self.pair(graph, proposer, candidate, rank);
        debug!("{proposer:?} claims {candidate:?} at rank {rank}");

        self.ensure_paired(graph, proposer, candidate)
    }

    /// `proposer` outranks `incumbent` and replaces it as `candidate`'s partner.
    fn steal<S: RegionShape>(
        &self,
        graph: &mut NodeGraph<S>,
        proposer: NodeId,
        candidate: NodeId,
        incumbent: NodeId,
        rank: usize,
    ) -> TrackResult<()> {
        self.ensure_paired(graph, incumbent, candidate)?;

        let evicted = graph.node_mut(incumbent);
        evicted.links_mut(self.mode).best_next = None;
        if self.mode == MatchMode::Distance && evicted.overlap.best_next == Some(candidate) {
            evicted.overlap.best_next = None;
        }

        self.pair(graph, proposer, candidate, rank);
        debug!("{proposer:?} takes {candidate:?} from {incumbent:?} at rank {rank}");

        if graph.node(incumbent).best_next().is_some() {
            return Err(TrackError::BrokenLink {
                from: incumbent.0,
                to: candidate.0,
                reason: "evicted node still points at its former partner",
            });
        }
        self.ensure_paired(graph, proposer, candidate)
    }

    fn pair<S: RegionShape>(
        &self,
        graph: &mut NodeGraph<S>,
        prev: NodeId,
        next: NodeId,
        rank: usize,
    ) {
        let target = graph.node_mut(next).links_mut(self.mode);
        target.best_prev = Some(prev);
        target.best_prev_rank = Some(rank);
        graph.node_mut(prev).links_mut(self.mode).best_next = Some(next);

        if self.mode == MatchMode::Distance {
            let general = &mut graph.node_mut(next).overlap;
            general.best_prev = Some(prev);
            general.best_prev_rank = None;
            graph.node_mut(prev).overlap.best_next = Some(next);
        }
    }

    fn ensure_paired<S: RegionShape>(
        &self,
        graph: &NodeGraph<S>,
        prev: NodeId,
        next: NodeId,
    ) -> TrackResult<()> {
        let modes: &[MatchMode] = match self.mode {
            MatchMode::Overlap => &[MatchMode::Overlap],
            MatchMode::Distance => &[MatchMode::Distance, MatchMode::Overlap],
        };
        for &mode in modes {
            let forward = graph.node(prev).links(mode).best_next == Some(next);
            let backward = graph.node(next).links(mode).best_prev == Some(prev);
            if !(forward && backward) {
                return Err(TrackError::BrokenLink {
                    from: prev.0,
                    to: next.0,
                    reason: "pair is not mirrored",
                });
            }
        }
        Ok(())
    }
}
