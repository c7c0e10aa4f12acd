//! Meridian Ensemble - Multi-model fan-out
//!
//! Dispatches one request across several pools in parallel under a
//! hierarchical cancellation tree, merges results by strategy, and
//! accounts per-branch cost for individual settlement.

pub mod cost;
pub mod runner;
pub mod streaming;
pub mod types;

pub use cost::BranchCostTracker;
pub use runner::{BranchScorer, DensityScorer, EnsembleRunner};
pub use streaming::{BranchCost, StreamingFirstComplete, StreamingOutcome};
pub use types::{
    BranchReport, BranchSpec, EnsembleConfig, EnsembleError, EnsembleResult, MergeStrategy, Result,
};
