//! CastAlgo Resolution Governance
//!
//! Turns a claimed market outcome into a final, auditable verdict through
//! either an N-of-M multisig or an optimistic dispute protocol, with a
//! scheduler that closes elapsed windows and a lock guard that makes final
//! verdicts immutable.

pub mod broadcaster;
pub mod clock;
pub mod config;
pub mod error;
pub mod governance;
pub mod models;
pub mod scheduler;
pub mod store;

pub use config::GovernanceConfig;
pub use error::{ErrorKind, GovernanceError, GovernanceResult};
pub use governance::GovernanceEngine;
pub use scheduler::{SchedulerHandle, SweepReport, WindowScheduler};
