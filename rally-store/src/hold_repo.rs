use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rally_core::{Hold, HoldRepository, SlotKey, StoreResult, TimeRange};
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::map_sqlx_error;

pub struct PgHoldRepository {
    pool: PgPool,
}

impl PgHoldRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const HOLD_COLUMNS: &str = "id, owner_id, resource_id, slot_date, start_time, end_time, holder_id, expires_at, booking_id, created_at";

#[derive(sqlx::FromRow)]
struct HoldRow {
    id: Uuid,
    owner_id: Uuid,
    resource_id: Uuid,
    slot_date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
    holder_id: String,
    expires_at: DateTime<Utc>,
    booking_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<HoldRow> for Hold {
    fn from(row: HoldRow) -> Self {
        Hold {
            id: row.id,
            key: SlotKey { owner_id: row.owner_id, resource_id: row.resource_id, date: row.slot_date },
            range: TimeRange { start: row.start_time, end: row.end_time },
            holder_id: row.holder_id,
            expires_at: row.expires_at,
            booking_id: row.booking_id,
            created_at: row.created_at,
        }
    }
}

fn into_holds(rows: Vec<HoldRow>) -> Vec<Hold> {
    rows.into_iter().map(Hold::from).collect()
}

#[async_trait]
impl HoldRepository for PgHoldRepository {
    async fn insert_hold(&self, hold: &Hold) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO holds (id, owner_id, resource_id, slot_date, start_time, end_time, holder_id, expires_at, booking_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(hold.id)
        .bind(hold.key.owner_id)
        .bind(hold.key.resource_id)
        .bind(hold.key.date)
        .bind(hold.range.start)
        .bind(hold.range.end)
        .bind(&hold.holder_id)
        .bind(hold.expires_at)
        .bind(hold.booking_id)
        .bind(hold.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_hold(&self, id: Uuid) -> StoreResult<Option<Hold>> {
        let row = sqlx::query_as::<_, HoldRow>(&format!("SELECT {} FROM holds WHERE id = $1", HOLD_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(Hold::from))
    }

    async fn find_active_overlapping(
        &self,
        key: &SlotKey,
        range: &TimeRange,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Hold>> {
        let rows = sqlx::query_as::<_, HoldRow>(&format!(
            r#"
            SELECT {} FROM holds
            WHERE owner_id = $1 AND resource_id = $2 AND slot_date = $3
              AND expires_at > $4
              AND start_time < $6 AND end_time > $5
            ORDER BY start_time
            "#,
            HOLD_COLUMNS
        ))
        .bind(key.owner_id)
        .bind(key.resource_id)
        .bind(key.date)
        .bind(now)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(into_holds(rows))
    }

    async fn list_active(
        &self,
        owner_id: Uuid,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Hold>> {
        let rows = sqlx::query_as::<_, HoldRow>(&format!(
            "SELECT {} FROM holds WHERE owner_id = $1 AND slot_date = $2 AND expires_at > $3 ORDER BY start_time",
            HOLD_COLUMNS
        ))
        .bind(owner_id)
        .bind(date)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(into_holds(rows))
    }

    async fn mark_converted(&self, id: Uuid, booking_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE holds SET booking_id = $2 WHERE id = $1")
            .bind(id)
            .bind(booking_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_hold(&self, id: Uuid) -> StoreResult<Option<Hold>> {
        let row = sqlx::query_as::<_, HoldRow>(&format!("DELETE FROM holds WHERE id = $1 RETURNING {}", HOLD_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(Hold::from))
    }

    async fn delete_for_booking(&self, booking_id: Uuid) -> StoreResult<Vec<Hold>> {
        let rows = sqlx::query_as::<_, HoldRow>(&format!(
            "DELETE FROM holds WHERE booking_id = $1 RETURNING {}",
            HOLD_COLUMNS
        ))
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(into_holds(rows))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<Hold>> {
        let rows = sqlx::query_as::<_, HoldRow>(&format!(
            "DELETE FROM holds WHERE expires_at < $1 RETURNING {}",
            HOLD_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(into_holds(rows))
    }
}
