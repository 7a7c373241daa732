//! # Haven Flows
//!
//! The orchestration layer over individual backup jobs: protection flows
//! fan out to per-VM work, agent telemetry streams back in, and terminal
//! job events roll up into flow-execution status. On startup, job recovery
//! reconciles whatever the database believes is running against what the
//! agent actually sees.

pub mod agent;
pub mod data_plane;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod telemetry;

pub use agent::{AgentClient, DataPlaneClient, TelemetryUpdate};
pub use data_plane::LocalDataPlane;
pub use error::{FlowError, FlowResult};
pub use orchestrator::FlowOrchestrator;
pub use recovery::JobRecovery;
pub use telemetry::TelemetryIngest;
