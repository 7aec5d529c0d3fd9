//! Parent/child job trees: creation, aggregate status derivation,
//! cancellation, and the reconciliation sweep that re-enqueues
//! interrupted work.

pub mod recovery;
pub mod tree;

pub use recovery::Reconciler;
pub use tree::Orchestrator;
