// THEORY:
// Every failure the tracking engine can report is funnelled through a single
// `TrackError` enum. The engine has very few error paths by nature: an empty
// frame is not an error (it is a gap), and a watershed marker that cannot be
// resolved simply ends a lineage. What remains is fatal by construction:
// corrupt shape geometry, a watershed collaborator that breaks its contract,
// or a broken link invariant in the node graph.

use thiserror::Error;

/// Errors produced while building, matching, correcting or assembling the node graph.
#[derive(Debug, Error)]
pub enum TrackError {
    /// A region shape reported geometry that cannot be trusted (fatal for the run).
    #[error("invalid shape {index} in frame {frame}: {reason}")]
    InvalidShape {
        frame: usize,
        index: usize,
        reason: String,
    },

    /// The watershed collaborator failed for a cluster in the given frame.
    #[error("watershed split failed in frame {frame}: {reason}")]
    Watershed { frame: usize, reason: String },

    /// The watershed collaborator returned a child list that does not line up with its markers.
    #[error("watershed returned {got} children for {expected} markers")]
    MarkerCountMismatch { expected: usize, got: usize },

    /// `best_next`/`best_prev` no longer mirror each other.
    #[error("broken link between node {from} and node {to}: {reason}")]
    BrokenLink {
        from: usize,
        to: usize,
        reason: &'static str,
    },

    #[error("invalid tracking configuration: {0}")]
    InvalidConfig(String),

    /// A background worker of the parallel graph builder panicked or was cancelled.
    #[error("graph worker failed: {0}")]
    Worker(String),
}

pub type TrackResult<T> = Result<T, TrackError>;
