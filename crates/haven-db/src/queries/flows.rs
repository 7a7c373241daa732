//! Protection flow and flow execution queries.
//!
//! The `running -> terminal` transition of an execution happens exactly once:
//! `complete_if_running` is a conditional update that only fires while the
//! row still reads `running`, so the telemetry rollup and the execution
//! monitor can race freely.

use crate::error::{DbError, DbResult};
use crate::models::{FlowExecution, ProtectionFlow};
use crate::pool::Pool;
use crate::queries::clamp_limit;
use sqlx::PgPool;
use uuid::Uuid;

/// Store for `protection_flows` and `flow_executions`.
pub struct FlowStore {
    pool: PgPool,
}

impl FlowStore {
    /// Create a new store.
    pub fn new(pool: &Pool) -> Self {
        Self {
            pool: pool.inner().clone(),
        }
    }

    /// Fetch a flow by id.
    pub async fn get_flow(&self, id: Uuid) -> DbResult<ProtectionFlow> {
        sqlx::query_as::<_, ProtectionFlow>("SELECT * FROM protection_flows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("protection flow {}", id)))
    }

    /// Insert a flow.
    pub async fn insert_flow(&self, flow: &ProtectionFlow) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO protection_flows (
                id, name, flow_type, target_type, target_id, repository_id,
                policy_id, schedule_id, enabled, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(flow.id)
        .bind(&flow.name)
        .bind(&flow.flow_type)
        .bind(&flow.target_type)
        .bind(&flow.target_id)
        .bind(&flow.repository_id)
        .bind(flow.policy_id)
        .bind(flow.schedule_id)
        .bind(flow.enabled)
        .bind(flow.created_at)
        .bind(flow.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Flows attached to a schedule, enabled only.
    pub async fn list_flows_for_schedule(&self, schedule_id: Uuid) -> DbResult<Vec<ProtectionFlow>> {
        Ok(sqlx::query_as::<_, ProtectionFlow>(
            "SELECT * FROM protection_flows WHERE schedule_id = $1 AND enabled = TRUE",
        )
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Create an execution row.
    pub async fn insert_execution(&self, execution: &FlowExecution) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO flow_executions (
                id, flow_id, status, execution_type, created_job_ids,
                jobs_created, jobs_completed, jobs_failed, jobs_skipped,
                vms_processed, bytes_transferred, started_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(execution.id)
        .bind(execution.flow_id)
        .bind(&execution.status)
        .bind(&execution.execution_type)
        .bind(&execution.created_job_ids)
        .bind(execution.jobs_created)
        .bind(execution.jobs_completed)
        .bind(execution.jobs_failed)
        .bind(execution.jobs_skipped)
        .bind(execution.vms_processed)
        .bind(execution.bytes_transferred)
        .bind(execution.started_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch an execution by id.
    pub async fn get_execution(&self, id: Uuid) -> DbResult<FlowExecution> {
        sqlx::query_as::<_, FlowExecution>("SELECT * FROM flow_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("flow execution {}", id)))
    }

    /// All executions still in `running`.
    pub async fn list_running_executions(&self) -> DbResult<Vec<FlowExecution>> {
        Ok(sqlx::query_as::<_, FlowExecution>(
            "SELECT * FROM flow_executions WHERE status = 'running' ORDER BY started_at ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Execution history for a flow, newest first, capped at 100 rows.
    pub async fn list_executions_for_flow(
        &self,
        flow_id: Uuid,
        limit: i64,
    ) -> DbResult<Vec<FlowExecution>> {
        Ok(sqlx::query_as::<_, FlowExecution>(
            r#"
            SELECT * FROM flow_executions
            WHERE flow_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(flow_id)
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?)
    }

    /// Record fan-out progress while the execution keeps running.
    pub async fn update_execution_progress(&self, execution: &FlowExecution) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE flow_executions
            SET created_job_ids = $2, jobs_created = $3, jobs_skipped = $4,
                vms_processed = $5, error_message = $6
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(&execution.created_job_ids)
        .bind(execution.jobs_created)
        .bind(execution.jobs_skipped)
        .bind(execution.vms_processed)
        .bind(&execution.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// One-shot terminal transition: succeeds only while the row still reads
    /// `running`. Returns false when another caller terminalised it first.
    pub async fn complete_if_running(
        &self,
        id: Uuid,
        final_status: &str,
        jobs_completed: i32,
        jobs_failed: i32,
        bytes_transferred: i64,
        execution_time_seconds: i32,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE flow_executions
            SET status = $2, jobs_completed = $3, jobs_failed = $4,
                bytes_transferred = $5, execution_time_seconds = $6,
                completed_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(final_status)
        .bind(jobs_completed)
        .bind(jobs_failed)
        .bind(bytes_transferred)
        .bind(execution_time_seconds)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Update flow statistics after an execution terminalises.
    pub async fn record_flow_result(
        &self,
        flow_id: Uuid,
        execution_id: Uuid,
        final_status: &str,
    ) -> DbResult<()> {
        // `warning` counts toward neither success nor failure.
        sqlx::query(
            r#"
            UPDATE protection_flows
            SET last_execution_id = $2,
                total_executions = total_executions + 1,
                successful_executions = successful_executions + CASE WHEN $3 = 'success' THEN 1 ELSE 0 END,
                failed_executions = failed_executions + CASE WHEN $3 = 'error' THEN 1 ELSE 0 END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(flow_id)
        .bind(execution_id)
        .bind(final_status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
