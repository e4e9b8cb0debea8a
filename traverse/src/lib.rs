//!
//! The types in this crate track a single run over a validated [`graph::Graph`].
//!
//! A [`Traversal`] owns the mutable state of every node in the meta-graph:
//! 1. Nodes start `Pending`; nodes with no upstream dependency start `Ready`.
//! 2. The executor pops ready nodes in a deterministic order
//!    (subject registration order, then topological rank, then node name).
//! 3. When a node completes, its outputs are recorded and its dependents are re-evaluated.
//! 4. When a node fails, every node downstream of it is skipped.
//!
//! Only one owner ever mutates a traversal, so state transitions are serialized
//! by construction. The graph itself is never modified.

/// per-run node state
mod traversal;
pub use traversal::{Counts, Traversal};

mod errors;
pub use errors::Errors;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Node \"{node}\" cannot move from {from} to {to}")]
    InvalidTransition {
        node: String,
        from: graph::NodeState,
        to: graph::NodeState,
    },
}
