//! Execution monitor.
//!
//! Fallback for missed terminal events: every 10 seconds, every running
//! flow execution is run through the shared maybe-complete routine. The
//! routine is a no-op while jobs are still in flight and a one-shot
//! transition once they are all terminal, so this loop is idempotent by
//! construction.

use crate::error::SchedulerResult;
use haven_db::{FlowStore, Pool};
use haven_flows::FlowOrchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Closes flow executions whose terminal events were missed.
pub struct ExecutionMonitor {
    tick: Duration,
    flows: FlowStore,
    orchestrator: Arc<FlowOrchestrator>,
}

impl ExecutionMonitor {
    /// Create a monitor over the shared pool.
    pub fn new(tick: Duration, pool: Pool, orchestrator: Arc<FlowOrchestrator>) -> Self {
        Self {
            tick,
            flows: FlowStore::new(&pool),
            orchestrator,
        }
    }

    /// Spawn the monitor loop.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            info!("execution monitor started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "execution monitor pass failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("execution monitor stopping");
                        return;
                    }
                }
            }
        })
    }

    /// One scan over running executions. Returns how many were closed.
    pub async fn run_once(&self) -> SchedulerResult<usize> {
        let executions = self.flows.list_running_executions().await?;
        let mut closed = 0;

        for execution in executions {
            match self.orchestrator.maybe_complete_execution(&execution).await {
                Ok(true) => {
                    debug!(execution_id = %execution.id, "execution closed by monitor");
                    closed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(execution_id = %execution.id, error = %e, "monitor rollup failed");
                }
            }
        }

        Ok(closed)
    }
}
