//! Transaction management with retry on transient failures.

use crate::error::{DbError, DbResult};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};

/// Transaction manager for multi-statement operations.
pub struct TransactionManager {
    pool: PgPool,
}

impl TransactionManager {
    /// Create a new transaction manager.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Execute a closure within a transaction, committing on success and
    /// rolling back on error.
    pub async fn execute<F, T>(&self, f: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(
                &'a mut Transaction<'_, Postgres>,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = DbResult<T>> + Send + 'a>,
            > + Send,
        T: Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::Transaction(format!("failed to begin: {}", e)))?;

        match f(&mut tx).await {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| DbError::Transaction(format!("failed to commit: {}", e)))?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback().await.map_err(|rollback_err| {
                    DbError::Transaction(format!(
                        "failed to rollback after error: {}. original error: {}",
                        rollback_err, e
                    ))
                })?;
                Err(e)
            }
        }
    }

    /// Execute with retry and exponential backoff on transient failures.
    /// Non-retryable errors surface immediately.
    pub async fn execute_with_retry<F, T>(&self, max_retries: u32, f: F) -> DbResult<T>
    where
        F: for<'a> Fn(
                &'a mut Transaction<'_, Postgres>,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = DbResult<T>> + Send + 'a>,
            > + Send
            + Sync,
        T: Send,
    {
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_retries {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DbError::Transaction(format!("failed to begin: {}", e)))?;

            match f(&mut tx).await {
                Ok(value) => match tx.commit().await {
                    Ok(_) => return Ok(value),
                    Err(e) => {
                        let err = DbError::Transaction(format!("failed to commit: {}", e));
                        last_error = Some(err);
                    }
                },
                Err(e) => {
                    let _ = tx.rollback().await;
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }

            attempts += 1;
            if attempts < max_retries {
                let delay = std::time::Duration::from_millis(100 * 2_u64.pow(attempts));
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| DbError::Transaction(format!("max retries ({}) exceeded", max_retries))))
    }
}
