//! # Haven Scheduler
//!
//! Time-driven parts of the control plane: the second-precision cron engine
//! that fires protection schedules, conflict detection over group batches,
//! the stale-job detector that recovers from silent agent crashes, and the
//! execution monitor that closes flow executions when terminal events were
//! missed.

pub mod conflict;
pub mod cron_engine;
pub mod error;
pub mod monitor;
pub mod stale;

pub use conflict::{plan_batch, BatchPlan, VmCandidate, VmDecision};
pub use cron_engine::{SchedulerConfig, SchedulerEngine};
pub use error::{SchedulerError, SchedulerResult};
pub use monitor::ExecutionMonitor;
pub use stale::StaleJobDetector;
