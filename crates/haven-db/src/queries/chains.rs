//! Backup chain queries. Head/tail updates run under a row lock so
//! concurrent additions to the same chain serialize.

use crate::error::{DbError, DbResult};
use crate::models::{BackupChain, BackupJob};
use crate::pool::Pool;
use sqlx::{PgPool, Postgres, Transaction};

/// Store for `backup_chains`.
#[derive(Clone)]
pub struct ChainStore {
    pool: PgPool,
}

impl ChainStore {
    /// Create a new store.
    pub fn new(pool: &Pool) -> Self {
        Self {
            pool: pool.inner().clone(),
        }
    }

    /// Underlying pool, for callers that open their own transactions.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fetch a chain by id.
    pub async fn get(&self, id: &str) -> DbResult<BackupChain> {
        sqlx::query_as::<_, BackupChain>("SELECT * FROM backup_chains WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("backup chain {}", id)))
    }

    /// Fetch the chain for a (VM context, disk), `None` when absent.
    pub async fn find_by_vm_disk(
        &self,
        vm_context_id: &str,
        disk_index: i32,
    ) -> DbResult<Option<BackupChain>> {
        Ok(sqlx::query_as::<_, BackupChain>(
            "SELECT * FROM backup_chains WHERE vm_context_id = $1 AND disk_index = $2",
        )
        .bind(vm_context_id)
        .bind(disk_index)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Insert a fresh chain row with an empty anchor.
    pub async fn create(&self, chain: &BackupChain) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_chains (
                id, vm_context_id, disk_index, full_backup_id, latest_backup_id,
                total_backups, total_size_bytes, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&chain.id)
        .bind(&chain.vm_context_id)
        .bind(chain.disk_index)
        .bind(&chain.full_backup_id)
        .bind(&chain.latest_backup_id)
        .bind(chain.total_backups)
        .bind(chain.total_size_bytes)
        .bind(chain.created_at)
        .bind(chain.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lock and fetch a chain row inside an open transaction.
    pub async fn get_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: &str,
    ) -> DbResult<BackupChain> {
        sqlx::query_as::<_, BackupChain>("SELECT * FROM backup_chains WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("backup chain {}", id)))
    }

    /// Persist head/tail/counter changes inside the locking transaction.
    pub async fn update_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        chain: &BackupChain,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE backup_chains
            SET full_backup_id = $2,
                latest_backup_id = $3,
                total_backups = $4,
                total_size_bytes = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(&chain.id)
        .bind(&chain.full_backup_id)
        .bind(&chain.latest_backup_id)
        .bind(chain.total_backups)
        .bind(chain.total_size_bytes)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("backup chain {}", chain.id)));
        }

        Ok(())
    }

    /// Ordered members of a (VM context, disk), read inside the locking
    /// transaction.
    pub async fn list_members_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        vm_context_id: &str,
        disk_index: i32,
    ) -> DbResult<Vec<BackupJob>> {
        Ok(sqlx::query_as::<_, BackupJob>(
            r#"
            SELECT * FROM backup_jobs
            WHERE vm_context_id = $1 AND disk_index = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(vm_context_id)
        .bind(disk_index)
        .fetch_all(&mut **tx)
        .await?)
    }

    /// Size of one member backup, read inside the locking transaction.
    pub async fn member_size_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        backup_id: &str,
    ) -> DbResult<i64> {
        use sqlx::Row;

        let row = sqlx::query("SELECT size_bytes FROM backup_jobs WHERE id = $1")
            .bind(backup_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("backup job {}", backup_id)))?;

        Ok(row.get::<i64, _>("size_bytes"))
    }

    /// Delete a chain row.
    pub async fn delete(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM backup_chains WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("backup chain {}", id)));
        }

        Ok(())
    }
}
