//! Incremental mapping: the control loop over the engines.
//!
//! - `controller`: session driver (load once, passes, relaxation)
//! - `attempt`: per-model state machine (seed, initialize, grow, finalize)
//! - `refinement`: local/global refinement invokers and trigger policy
//! - `tracks`: triangulation and track maintenance invoker
//! - `registration`: seed and next-image registration invoker

pub mod attempt;
pub mod controller;
pub mod refinement;
pub mod registration;
pub mod tracks;

pub use attempt::{
    AttemptOutcome, AttemptReport, DiscardReason, GrowthTermination, MapperServices, PassControl, PassReport,
    ReconstructionPass,
};
pub use controller::{IncrementalMapperController, RunReport, RunStatus, NUM_INIT_RELAXATIONS};
pub use refinement::{
    global_bundle_adjustment_options, iterative_global_refinement, iterative_local_refinement, GlobalRefinementSummary,
    GlobalRefinementTrigger, LocalRefinementSummary,
};
