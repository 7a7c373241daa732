//! Conflict detection over a group batch.
//!
//! Before the scheduler dispatches jobs for a group's members it runs the
//! batch through three checks: the phantom-job check (a VM's stored
//! running job must still have agent evidence to count as active), the
//! per-VM active-job check (`skip_if_running`), and the per-group
//! concurrency cap. The planning itself is pure; the engine gathers the
//! facts.

use haven_flows::agent::{AgentClient, AgentJobState};
use haven_db::BackupJobStore;
use serde::Serialize;
use tracing::warn;

/// Facts gathered about one candidate VM.
#[derive(Debug, Clone)]
pub struct VmCandidate {
    pub vm_context_id: String,
    /// The database shows a running job for this VM.
    pub has_running_job: bool,
    /// The agent confirms that running job actually exists. Meaningless
    /// when `has_running_job` is false.
    pub agent_confirms_job: bool,
}

/// Outcome for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmDecision {
    Dispatch,
    SkipActiveJob,
    SkipGroupCap,
}

/// Planned outcome for a whole batch, in input order.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub decisions: Vec<(String, VmDecision)>,
}

impl BatchPlan {
    /// VMs cleared for dispatch, in priority order.
    pub fn dispatchable(&self) -> impl Iterator<Item = &str> {
        self.decisions
            .iter()
            .filter(|(_, d)| *d == VmDecision::Dispatch)
            .map(|(vm, _)| vm.as_str())
    }

    /// Count of skipped VMs.
    pub fn skipped(&self) -> usize {
        self.decisions
            .iter()
            .filter(|(_, d)| *d != VmDecision::Dispatch)
            .count()
    }
}

/// Pure batch planning. Candidates arrive in priority order; dispatches
/// never exceed `max_concurrent_vms`. A running job without agent evidence
/// is a phantom and does not block its VM.
pub fn plan_batch(
    candidates: &[VmCandidate],
    skip_if_running: bool,
    max_concurrent_vms: usize,
) -> BatchPlan {
    let mut decisions = Vec::with_capacity(candidates.len());
    let mut dispatched = 0usize;

    for candidate in candidates {
        let actively_running = candidate.has_running_job && candidate.agent_confirms_job;

        let decision = if skip_if_running && actively_running {
            VmDecision::SkipActiveJob
        } else if dispatched >= max_concurrent_vms {
            VmDecision::SkipGroupCap
        } else {
            dispatched += 1;
            VmDecision::Dispatch
        };

        decisions.push((candidate.vm_context_id.clone(), decision));
    }

    BatchPlan { decisions }
}

/// Gather candidate facts for a batch of VM ids, in order.
pub async fn gather_candidates(
    backups: &BackupJobStore,
    agent: &AgentClient,
    vm_context_ids: &[String],
) -> Vec<VmCandidate> {
    let mut candidates = Vec::with_capacity(vm_context_ids.len());

    for vm_context_id in vm_context_ids {
        let running_job_id = match backups.running_job_id(vm_context_id).await {
            Ok(job_id) => job_id,
            Err(e) => {
                warn!(vm_context_id, error = %e, "active-job check failed, assuming busy");
                candidates.push(VmCandidate {
                    vm_context_id: vm_context_id.clone(),
                    has_running_job: true,
                    agent_confirms_job: true,
                });
                continue;
            }
        };
        let has_running_job = running_job_id.is_some();

        // Phantom check: a stored running job only blocks dispatch when
        // the agent can still see it.
        let agent_confirms_job = match &running_job_id {
            Some(job_id) => match agent.get_progress(job_id).await {
                Ok(progress) => progress.state != AgentJobState::NotFound,
                Err(e) => {
                    warn!(vm_context_id, error = %e, "agent unreachable for phantom check, assuming job exists");
                    true
                }
            },
            None => false,
        };

        if has_running_job && !agent_confirms_job {
            warn!(vm_context_id, "phantom job detected: stored running job has no agent evidence");
        }

        candidates.push(VmCandidate {
            vm_context_id: vm_context_id.clone(),
            has_running_job,
            agent_confirms_job,
        });
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(vm: &str, running: bool, confirmed: bool) -> VmCandidate {
        VmCandidate {
            vm_context_id: vm.to_string(),
            has_running_job: running,
            agent_confirms_job: confirmed,
        }
    }

    #[test]
    fn test_idle_vms_dispatch_up_to_cap() {
        let batch = vec![
            candidate("vm-a", false, false),
            candidate("vm-b", false, false),
            candidate("vm-c", false, false),
        ];
        let plan = plan_batch(&batch, true, 2);

        assert_eq!(plan.dispatchable().count(), 2);
        assert_eq!(plan.decisions[2].1, VmDecision::SkipGroupCap);
    }

    #[test]
    fn test_active_job_skips_vm() {
        let batch = vec![candidate("vm-a", true, true), candidate("vm-b", false, false)];
        let plan = plan_batch(&batch, true, 5);

        assert_eq!(plan.decisions[0].1, VmDecision::SkipActiveJob);
        assert_eq!(plan.decisions[1].1, VmDecision::Dispatch);
        assert_eq!(plan.skipped(), 1);
    }

    #[test]
    fn test_phantom_job_does_not_block() {
        // Database says running, agent has no evidence.
        let batch = vec![candidate("vm-a", true, false)];
        let plan = plan_batch(&batch, true, 5);

        assert_eq!(plan.decisions[0].1, VmDecision::Dispatch);
    }

    #[test]
    fn test_skip_if_running_disabled_dispatches_busy_vm() {
        let batch = vec![candidate("vm-a", true, true)];
        let plan = plan_batch(&batch, false, 5);

        assert_eq!(plan.decisions[0].1, VmDecision::Dispatch);
    }

    #[test]
    fn test_cap_applies_after_skips() {
        let batch = vec![
            candidate("vm-a", true, true),
            candidate("vm-b", false, false),
            candidate("vm-c", false, false),
        ];
        let plan = plan_batch(&batch, true, 1);

        assert_eq!(plan.decisions[0].1, VmDecision::SkipActiveJob);
        assert_eq!(plan.decisions[1].1, VmDecision::Dispatch);
        assert_eq!(plan.decisions[2].1, VmDecision::SkipGroupCap);
    }
}
