//! Monte-Carlo harness for evaluating HIPRI/LOPRI downgrade algorithms.
//!
//! Two sweeps are supported:
//! - the open-loop sweep measures usage samplers and host selectors against
//!   exact knowledge of host usage, and
//! - the feedback sweep runs closed-loop downgrade scenarios and measures
//!   convergence, churn, and realized overage/shortage.
//!
//! Configs enumerate into instances (one per point in the swept cross
//! product) and instances run as sharded jobs on a bounded worker pool.

pub mod config;
pub mod stats;

mod feedback;
mod runner;
mod sim;

pub use feedback::{
    BasicDowngradeSummary, FeedbackControlSummary, FeedbackInstanceResult, ScenarioResult,
};
pub use runner::{
    default_parallelism, eval_multi_feedback_to_json, eval_multi_to_json, EvalError, RunOptions,
};
pub use sim::{
    downgrade_frac, DowngradeSummary, InstanceResult, RateLimitSummary, SamplerSummary, SysResult,
};
