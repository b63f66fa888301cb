use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rally_core::{IdempotencyRecord, IdempotencyRepository, StoreResult};
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::map_sqlx_error;

pub struct PgIdempotencyRepository {
    pool: PgPool,
}

impl PgIdempotencyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyRepository for PgIdempotencyRepository {
    async fn find(
        &self,
        key: &str,
        not_before: DateTime<Utc>,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let row: Option<(String, Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT key, booking_id, created_at FROM idempotency_records WHERE key = $1 AND created_at >= $2",
        )
        .bind(key)
        .bind(not_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(|(key, booking_id, created_at)| IdempotencyRecord { key, booking_id, created_at }))
    }

    async fn insert(&self, record: &IdempotencyRecord) -> StoreResult<()> {
        sqlx::query("INSERT INTO idempotency_records (key, booking_id, created_at) VALUES ($1, $2, $3)")
            .bind(&record.key)
            .bind(record.booking_id)
            .bind(record.created_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}
