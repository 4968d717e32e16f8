//! Process pipeline execution for kubedeploy.
//!
//! Runs a [`Plan`](kubedeploy_core::Plan) one step at a time:
//! - single operations inherit the invoking process's streams
//! - templating pairs are joined by an OS pipe
//! - rollout checks are bounded by a deadline

pub mod pipeline;
pub mod process;
pub mod rollout;

pub use pipeline::{OperationState, PipelineExecutor, RunReport};
pub use process::{PairPhase, ProcessError};
pub use rollout::{RolloutOutcome, RolloutVerifier};
