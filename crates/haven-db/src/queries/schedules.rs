//! Schedule, group and membership queries.

use crate::error::{DbError, DbResult};
use crate::models::{GroupMembership, MachineGroup, Schedule, ScheduleExecution};
use crate::pool::Pool;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Store for `schedules`, `machine_groups`, `group_memberships` and
/// `schedule_executions`.
pub struct ScheduleStore {
    pool: PgPool,
}

impl ScheduleStore {
    /// Create a new store.
    pub fn new(pool: &Pool) -> Self {
        Self {
            pool: pool.inner().clone(),
        }
    }

    /// Fetch a schedule by id, `None` when absent.
    pub async fn find(&self, id: Uuid) -> DbResult<Option<Schedule>> {
        Ok(
            sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Fetch a schedule by id.
    pub async fn get(&self, id: Uuid) -> DbResult<Schedule> {
        self.find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("schedule {}", id)))
    }

    /// All enabled schedules.
    pub async fn list_enabled(&self) -> DbResult<Vec<Schedule>> {
        Ok(sqlx::query_as::<_, Schedule>(
            "SELECT * FROM schedules WHERE enabled = TRUE ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Insert a schedule.
    pub async fn insert(&self, schedule: &Schedule) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (
                id, name, cron_expression, timezone, schedule_type, enabled,
                max_concurrent_jobs, skip_if_running, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(&schedule.timezone)
        .bind(&schedule.schedule_type)
        .bind(schedule.enabled)
        .bind(schedule.max_concurrent_jobs)
        .bind(schedule.skip_if_running)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Groups attached to a schedule, highest priority first.
    pub async fn groups_for_schedule(&self, schedule_id: Uuid) -> DbResult<Vec<MachineGroup>> {
        Ok(sqlx::query_as::<_, MachineGroup>(
            "SELECT * FROM machine_groups WHERE schedule_id = $1 ORDER BY priority DESC",
        )
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Insert a machine group.
    pub async fn insert_group(&self, group: &MachineGroup) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO machine_groups (id, name, priority, max_concurrent_vms, schedule_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(group.id)
        .bind(&group.name)
        .bind(group.priority)
        .bind(group.max_concurrent_vms)
        .bind(group.schedule_id)
        .bind(group.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Enabled memberships of a group ordered by priority.
    pub async fn enabled_memberships(&self, group_id: Uuid) -> DbResult<Vec<GroupMembership>> {
        Ok(sqlx::query_as::<_, GroupMembership>(
            r#"
            SELECT * FROM group_memberships
            WHERE group_id = $1 AND enabled = TRUE
            ORDER BY priority DESC
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Insert a group membership.
    pub async fn insert_membership(&self, membership: &GroupMembership) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO group_memberships (id, group_id, vm_context_id, priority, enabled)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(membership.id)
        .bind(membership.group_id)
        .bind(&membership.vm_context_id)
        .bind(membership.priority)
        .bind(membership.enabled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create a schedule execution row.
    pub async fn insert_execution(&self, execution: &ScheduleExecution) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO schedule_executions (
                id, schedule_id, status, trigger_reason, jobs_created,
                jobs_skipped, jobs_failed, vm_context_ids, started_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(execution.id)
        .bind(execution.schedule_id)
        .bind(&execution.status)
        .bind(&execution.trigger_reason)
        .bind(execution.jobs_created)
        .bind(execution.jobs_skipped)
        .bind(execution.jobs_failed)
        .bind(&execution.vm_context_ids)
        .bind(execution.started_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Close a schedule execution with aggregate counts.
    pub async fn finish_execution(&self, execution: &ScheduleExecution) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE schedule_executions
            SET status = $2, jobs_created = $3, jobs_skipped = $4,
                jobs_failed = $5, vm_context_ids = $6, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(&execution.status)
        .bind(execution.jobs_created)
        .bind(execution.jobs_skipped)
        .bind(execution.jobs_failed)
        .bind(&execution.vm_context_ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Count schedule executions still running, for the global cap.
    pub async fn count_running_executions(&self) -> DbResult<i64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM schedule_executions WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await?;

        Ok(row.get::<i64, _>("n"))
    }
}
