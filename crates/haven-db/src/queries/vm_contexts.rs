//! VM context queries.

use crate::error::{DbError, DbResult};
use crate::models::VmContext;
use crate::pool::Pool;
use sqlx::PgPool;

/// Store for `vm_contexts`.
pub struct VmContextStore {
    pool: PgPool,
}

impl VmContextStore {
    /// Create a new store.
    pub fn new(pool: &Pool) -> Self {
        Self {
            pool: pool.inner().clone(),
        }
    }

    /// Fetch a VM context by id.
    pub async fn get(&self, id: &str) -> DbResult<VmContext> {
        sqlx::query_as::<_, VmContext>("SELECT * FROM vm_contexts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("vm context {}", id)))
    }

    /// Insert or refresh a discovered VM context.
    pub async fn upsert(&self, ctx: &VmContext) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO vm_contexts (id, vm_name, state, current_job_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET vm_name = EXCLUDED.vm_name, updated_at = NOW()
            "#,
        )
        .bind(&ctx.id)
        .bind(&ctx.vm_name)
        .bind(&ctx.state)
        .bind(&ctx.current_job_id)
        .bind(ctx.created_at)
        .bind(ctx.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update the lifecycle state.
    pub async fn set_state(&self, id: &str, state: &str) -> DbResult<()> {
        let result =
            sqlx::query("UPDATE vm_contexts SET state = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(state)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("vm context {}", id)));
        }

        Ok(())
    }

    /// Point the context at its active job.
    pub async fn set_current_job(&self, id: &str, job_id: &str) -> DbResult<()> {
        sqlx::query("UPDATE vm_contexts SET current_job_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Clear the active-job pointer so new work may start.
    pub async fn clear_current_job(&self, id: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE vm_contexts SET current_job_id = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
