//! Closed-loop simulation of HIPRI/LOPRI downgrade feedback control.
//!
//! A [`Scenario`] fixes the host demands, capacities, sampling policy, and
//! controller gains; an [`ActiveScenario`] then iterates the control loop:
//! collect (possibly sampled) usage, compute a downgrade-fraction increment,
//! and reassign flows between priority classes via consistent hashing.

use thiserror::Error;

mod control;
mod scenario;
mod usage;

pub use control::{DowngradeFracController, Ewma};
pub use scenario::{
    count_changed_qos, count_flips, ActiveScenario, MultiIterRec, MultiIterState,
    RerunnableScenario, Scenario, ScenarioRec,
};
pub use usage::{ClassUsage, UsageCollector, UsageInfo};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("error writing record: {0}")]
    WriteRecord(#[source] serde_json::Error),
    #[error("error flushing records: {0}")]
    Flush(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScenarioError>;
