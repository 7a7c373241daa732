//! Second-precision cron engine for protection schedules.
//!
//! One registered entry per enabled schedule. A tick reloads the schedule
//! row (disabled rows never enter tracking), honours the global running-
//! execution cap, records a schedule execution, runs conflict detection
//! over each attached group and dispatches per-VM jobs through the flow
//! orchestrator. Reload is diff-based and never interrupts a running
//! execution.

use crate::conflict::{self, plan_batch};
use crate::error::{SchedulerError, SchedulerResult};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use haven_db::models::{Schedule, ScheduleExecution};
use haven_db::{BackupJobStore, FlowStore, Pool, ScheduleStore};
use haven_flows::agent::AgentClient;
use haven_flows::FlowOrchestrator;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Global cap on concurrently running schedule executions.
    pub max_concurrent: usize,
    /// How long shutdown waits for in-flight executions.
    pub shutdown_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            shutdown_wait: Duration::from_secs(60),
        }
    }
}

struct RegisteredSchedule {
    cron: CronSchedule,
    timezone: Tz,
    next_run: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    is_running: bool,
}

impl RegisteredSchedule {
    fn advance(&mut self, now: DateTime<Utc>) {
        self.next_run = self
            .cron
            .after(&now.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc));
    }
}

/// The cron engine.
pub struct SchedulerEngine {
    config: SchedulerConfig,
    schedules: ScheduleStore,
    backups: BackupJobStore,
    flows: FlowStore,
    orchestrator: Arc<FlowOrchestrator>,
    agent: AgentClient,
    registered: Arc<RwLock<HashMap<Uuid, RegisteredSchedule>>>,
}

impl SchedulerEngine {
    /// Create the engine over the shared pool.
    pub fn new(
        config: SchedulerConfig,
        pool: Pool,
        orchestrator: Arc<FlowOrchestrator>,
        agent: AgentClient,
    ) -> Self {
        Self {
            config,
            schedules: ScheduleStore::new(&pool),
            backups: BackupJobStore::new(&pool),
            flows: FlowStore::new(&pool),
            orchestrator,
            agent,
            registered: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register one schedule, validating its cron expression and timezone.
    pub async fn register(&self, schedule: &Schedule) -> SchedulerResult<()> {
        let cron = parse_cron(&schedule.cron_expression)?;
        let timezone: Tz = Tz::from_str(&schedule.timezone)
            .map_err(|_| SchedulerError::InvalidTimezone(schedule.timezone.clone()))?;

        let mut entry = RegisteredSchedule {
            cron,
            timezone,
            next_run: None,
            last_run: None,
            is_running: false,
        };
        entry.advance(Utc::now());

        debug!(schedule_id = %schedule.id, next_run = ?entry.next_run, "schedule registered");
        self.registered.write().await.insert(schedule.id, entry);
        Ok(())
    }

    /// Load and register every enabled schedule. Invalid rows are logged
    /// and skipped.
    pub async fn load_schedules(&self) -> SchedulerResult<usize> {
        let schedules = self.schedules.list_enabled().await?;
        let mut registered = 0;

        for schedule in &schedules {
            match self.register(schedule).await {
                Ok(()) => registered += 1,
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "skipping schedule");
                }
            }
        }

        Ok(registered)
    }

    /// Diff registered entries against currently enabled schedules: drop
    /// the no-longer-enabled, add the new, keep the rest untouched.
    pub async fn reload_schedules(&self) -> SchedulerResult<()> {
        let enabled = self.schedules.list_enabled().await?;
        let enabled_ids: Vec<Uuid> = enabled.iter().map(|s| s.id).collect();

        {
            let mut registered = self.registered.write().await;
            registered.retain(|id, _| enabled_ids.contains(id));
        }

        for schedule in &enabled {
            let known = self.registered.read().await.contains_key(&schedule.id);
            if !known {
                if let Err(e) = self.register(schedule).await {
                    error!(schedule_id = %schedule.id, error = %e, "failed to register schedule on reload");
                }
            }
        }

        info!(count = enabled_ids.len(), "schedules reloaded");
        Ok(())
    }

    /// Spawn the 1 Hz tick loop.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self;
        let mut shutdown = shutdown;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            info!("scheduler started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        engine.clone().fire_due(Utc::now()).await;
                    }
                    _ = shutdown.changed() => {
                        engine.drain().await;
                        info!("scheduler stopped");
                        return;
                    }
                }
            }
        })
    }

    async fn fire_due(self: Arc<Self>, now: DateTime<Utc>) {
        let due: Vec<Uuid> = {
            let mut registered = self.registered.write().await;
            registered
                .iter_mut()
                .filter_map(|(id, entry)| {
                    let due = !entry.is_running
                        && entry.next_run.is_some_and(|next| next <= now);
                    if due {
                        entry.is_running = true;
                        entry.advance(now);
                        Some(*id)
                    } else {
                        None
                    }
                })
                .collect()
        };

        for schedule_id in due {
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.handle_tick(schedule_id, "cron").await {
                    error!(schedule_id = %schedule_id, error = %e, "schedule tick failed");
                }
                engine.finish_tracking(schedule_id).await;
            });
        }
    }

    /// Run the trigger pipeline for one schedule.
    async fn handle_tick(&self, schedule_id: Uuid, trigger_reason: &str) -> SchedulerResult<()> {
        // Early guard: reload the row; disabled or missing rows never
        // enter tracking.
        let Some(schedule) = self.schedules.find(schedule_id).await? else {
            warn!(schedule_id = %schedule_id, "schedule row vanished, skipping tick");
            return Ok(());
        };
        if !schedule.enabled {
            debug!(schedule_id = %schedule_id, "schedule disabled, skipping tick");
            return Ok(());
        }

        // Global concurrency cap across all schedules.
        let running = self.schedules.count_running_executions().await?;
        if running >= self.config.max_concurrent as i64 {
            warn!(schedule_id = %schedule_id, running, cap = self.config.max_concurrent, "global execution cap reached, skipping tick");
            return Ok(());
        }

        let mut execution = ScheduleExecution {
            id: Uuid::new_v4(),
            schedule_id,
            status: "running".to_string(),
            trigger_reason: Some(trigger_reason.to_string()),
            jobs_created: 0,
            jobs_skipped: 0,
            jobs_failed: 0,
            vm_context_ids: String::new(),
            started_at: Utc::now(),
            completed_at: None,
        };
        self.schedules.insert_execution(&execution).await?;
        info!(schedule_id = %schedule_id, execution_id = %execution.id, trigger_reason, "schedule execution started");

        let attached_flows = self.flows.list_flows_for_schedule(schedule_id).await?;
        let groups = self.schedules.groups_for_schedule(schedule_id).await?;
        let mut processed: Vec<String> = Vec::new();

        for group in groups {
            let memberships = self.schedules.enabled_memberships(group.id).await?;
            let vm_ids: Vec<String> = memberships.into_iter().map(|m| m.vm_context_id).collect();
            if vm_ids.is_empty() {
                continue;
            }

            let candidates =
                conflict::gather_candidates(&self.backups, &self.agent, &vm_ids).await;
            let plan = plan_batch(
                &candidates,
                schedule.skip_if_running,
                group.max_concurrent_vms.max(0) as usize,
            );
            execution.jobs_skipped += plan.skipped() as i32;

            // A backup flow attached to this group decides repository and
            // policy; otherwise the group replicates.
            let group_flow = attached_flows.iter().find(|f| {
                f.target_type == "group" && f.target_id == group.id.to_string()
            });

            for vm_context_id in plan.dispatchable() {
                let dispatch = match group_flow {
                    Some(flow) if flow.flow_type == "backup" => {
                        let Some(repository_id) = flow.repository_id.as_deref() else {
                            warn!(flow = %flow.name, "backup flow without repository, skipping VM");
                            execution.jobs_failed += 1;
                            continue;
                        };
                        self.orchestrator
                            .create_backup_job(vm_context_id, repository_id, flow.policy_id)
                            .await
                    }
                    _ => self.orchestrator.create_replication_job(vm_context_id).await,
                };

                match dispatch {
                    Ok(job_id) => {
                        debug!(vm_context_id, job_id = %job_id, "scheduled job dispatched");
                        execution.jobs_created += 1;
                        processed.push(vm_context_id.to_string());
                    }
                    Err(e) => {
                        warn!(vm_context_id, error = %e, "scheduled dispatch failed");
                        execution.jobs_failed += 1;
                    }
                }
            }
        }

        execution.vm_context_ids = processed.join(",");
        execution.status =
            schedule_final_status(execution.jobs_created, execution.jobs_failed).to_string();
        self.schedules.finish_execution(&execution).await?;

        info!(
            schedule_id = %schedule_id,
            execution_id = %execution.id,
            created = execution.jobs_created,
            skipped = execution.jobs_skipped,
            failed = execution.jobs_failed,
            status = %execution.status,
            "schedule execution finished"
        );
        Ok(())
    }

    /// Manual trigger: bypasses the cron entry but runs the same pipeline.
    pub async fn trigger_manual(&self, schedule_id: Uuid) -> SchedulerResult<()> {
        {
            let mut registered = self.registered.write().await;
            if let Some(entry) = registered.get_mut(&schedule_id) {
                if entry.is_running {
                    warn!(schedule_id = %schedule_id, "schedule already running, manual trigger skipped");
                    return Ok(());
                }
                entry.is_running = true;
            }
        }

        let result = self.handle_tick(schedule_id, "manual").await;
        self.finish_tracking(schedule_id).await;
        result
    }

    async fn finish_tracking(&self, schedule_id: Uuid) {
        let mut registered = self.registered.write().await;
        if let Some(entry) = registered.get_mut(&schedule_id) {
            entry.is_running = false;
            entry.last_run = Some(Utc::now());
        }
    }

    /// Wait for in-flight executions on shutdown; timeout is logged, not
    /// fatal.
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_wait;

        loop {
            let busy = {
                let registered = self.registered.read().await;
                registered.values().any(|e| e.is_running)
            };
            if !busy {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown wait for in-flight schedule executions timed out");
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Registered schedule count.
    pub async fn registered_count(&self) -> usize {
        self.registered.read().await.len()
    }

    /// Tracking snapshot of every registered entry.
    pub async fn snapshot(&self) -> Vec<ScheduleEntryStatus> {
        let registered = self.registered.read().await;
        registered
            .iter()
            .map(|(id, entry)| ScheduleEntryStatus {
                schedule_id: *id,
                next_run: entry.next_run,
                last_run: entry.last_run,
                is_running: entry.is_running,
            })
            .collect()
    }
}

/// Tracking state of one registered schedule.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduleEntryStatus {
    pub schedule_id: Uuid,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub is_running: bool,
}

/// Parse a cron expression, normalising to the 7-field form with seconds.
pub fn parse_cron(expression: &str) -> SchedulerResult<CronSchedule> {
    let normalised = normalise_cron(expression);
    CronSchedule::from_str(&normalised).map_err(|e| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Accept the common 5-field form by prepending a seconds field and
/// appending a years wildcard.
fn normalise_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    match fields {
        5 => format!("0 {} *", expression),
        6 => format!("0 {}", expression),
        _ => expression.to_string(),
    }
}

/// Final status of a schedule execution from its counts.
pub fn schedule_final_status(created: i32, failed: i32) -> &'static str {
    if failed == 0 {
        "completed"
    } else if created == 0 {
        "failed"
    } else {
        "warning"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_five_field_cron() {
        // Daily at 02:00, classic crontab form.
        assert!(parse_cron("0 2 * * *").is_ok());
    }

    #[test]
    fn test_parse_seven_field_cron() {
        assert!(parse_cron("30 0 2 * * * *").is_ok());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_cron("not a cron").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
    }

    #[test]
    fn test_normalise_cron_field_counts() {
        assert_eq!(normalise_cron("0 2 * * *"), "0 0 2 * * * *");
        assert_eq!(normalise_cron("15 0 2 * * *"), "0 15 0 2 * * *");
        assert_eq!(normalise_cron("0 15 0 2 * * *"), "0 15 0 2 * * *");
    }

    #[test]
    fn test_schedule_final_status() {
        assert_eq!(schedule_final_status(3, 0), "completed");
        assert_eq!(schedule_final_status(0, 2), "failed");
        assert_eq!(schedule_final_status(2, 1), "warning");
        assert_eq!(schedule_final_status(0, 0), "completed");
    }
}
