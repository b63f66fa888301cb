use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rally_core::{
    Booking, BookingRepository, BookingStatus, PayerRef, PaymentShare, Refund, RefundTerms,
    ShareMark, ShareRepository, SlotKey, StoreError, StoreResult, TimeRange,
};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::database::{corrupt_row, map_sqlx_error};

/// Bookings, their payment shares and refunds. One repository because a
/// booking and its shares are written in a single transaction.
pub struct PgBookingRepository {
    pool: PgPool,
}

impl PgBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const BOOKING_COLUMNS: &str = "id, owner_id, resource_id, slot_date, start_time, end_time, initiator_id, initiator_name, status, total_cents, paid_cents, payment_deadline, details, created_at, updated_at, deleted_at";

const SHARE_COLUMNS: &str = "id, booking_id, payer, amount_cents, paid_at, payment_reference, invite_token";

const OCCUPYING: &[&str] = &["initiated", "locked", "pending_payments", "partially_paid", "confirmed"];
const EXPIRABLE: &[&str] = &["initiated", "locked", "pending_payments", "partially_paid"];

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    owner_id: Uuid,
    resource_id: Uuid,
    slot_date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
    initiator_id: String,
    initiator_name: String,
    status: String,
    total_cents: i64,
    paid_cents: i64,
    payment_deadline: Option<DateTime<Utc>>,
    details: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = rally_core::StoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<BookingStatus>()
            .map_err(|e| corrupt_row("booking", e))?;
        Ok(Booking {
            id: row.id,
            key: SlotKey { owner_id: row.owner_id, resource_id: row.resource_id, date: row.slot_date },
            range: TimeRange { start: row.start_time, end: row.end_time },
            initiator_id: row.initiator_id,
            initiator_name: row.initiator_name,
            status,
            total_cents: row.total_cents,
            paid_cents: row.paid_cents,
            payment_deadline: row.payment_deadline,
            details: row.details,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

fn into_bookings(rows: Vec<BookingRow>) -> StoreResult<Vec<Booking>> {
    rows.into_iter().map(Booking::try_from).collect()
}

#[derive(sqlx::FromRow)]
struct ShareRow {
    id: Uuid,
    booking_id: Uuid,
    payer: Option<Json<PayerRef>>,
    amount_cents: i64,
    paid_at: Option<DateTime<Utc>>,
    payment_reference: Option<String>,
    invite_token: Option<String>,
}

impl From<ShareRow> for PaymentShare {
    fn from(row: ShareRow) -> Self {
        PaymentShare {
            id: row.id,
            booking_id: row.booking_id,
            payer: row.payer.map(|p| p.0),
            amount_cents: row.amount_cents,
            paid_at: row.paid_at,
            payment_reference: row.payment_reference,
            invite_token: row.invite_token,
        }
    }
}

/// Lock a booking row for the rest of `tx`, returning its total and status.
async fn lock_booking(
    tx: &mut Transaction<'_, Postgres>,
    booking_id: Uuid,
) -> StoreResult<Option<(i64, BookingStatus)>> {
    let locked: Option<(i64, String)> =
        sqlx::query_as("SELECT total_cents, status FROM bookings WHERE id = $1 FOR UPDATE")
            .bind(booking_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
    locked
        .map(|(total, status)| {
            let status = status.parse::<BookingStatus>().map_err(|e| corrupt_row("booking", e))?;
            Ok((total, status))
        })
        .transpose()
}

/// Write the paid sum of a locked booking back onto it. Terminal bookings
/// keep their status.
async fn settle_locked(
    tx: &mut Transaction<'_, Postgres>,
    booking_id: Uuid,
    total_cents: i64,
    current: BookingStatus,
) -> StoreResult<Booking> {
    let paid_cents = paid_sum(tx, booking_id).await?;
    let next = if current.is_terminal() {
        current
    } else {
        BookingStatus::from_payment(paid_cents, total_cents)
    };
    let row = sqlx::query_as::<_, BookingRow>(&format!(
        "UPDATE bookings SET paid_cents = $2, status = $3, updated_at = NOW() WHERE id = $1 RETURNING {}",
        BOOKING_COLUMNS
    ))
    .bind(booking_id)
    .bind(paid_cents)
    .bind(next.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;
    Booking::try_from(row)
}

async fn paid_sum(tx: &mut Transaction<'_, Postgres>, booking_id: Uuid) -> StoreResult<i64> {
    let (paid_cents,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount_cents), 0)::BIGINT FROM payment_shares WHERE booking_id = $1 AND paid_at IS NOT NULL",
    )
    .bind(booking_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;
    Ok(paid_cents)
}

async fn write_refund(executor: &mut sqlx::PgConnection, refund: &Refund) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO refunds (id, booking_id, amount_cents, expected_by, actor, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(refund.id)
    .bind(refund.booking_id)
    .bind(refund.amount_cents)
    .bind(refund.expected_by)
    .bind(&refund.actor)
    .bind(refund.created_at)
    .execute(executor)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

async fn insert_shares(
    tx: &mut Transaction<'_, Postgres>,
    shares: &[PaymentShare],
) -> StoreResult<()> {
    for share in shares {
        sqlx::query(
            r#"
            INSERT INTO payment_shares (id, booking_id, payer, amount_cents, paid_at, payment_reference, invite_token)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(share.id)
        .bind(share.booking_id)
        .bind(share.payer.as_ref().map(Json))
        .bind(share.amount_cents)
        .bind(share.paid_at)
        .bind(share.payment_reference.as_deref())
        .bind(share.invite_token.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;
    }
    Ok(())
}

#[async_trait]
impl BookingRepository for PgBookingRepository {
    async fn find_active_overlapping(
        &self,
        key: &SlotKey,
        range: &TimeRange,
        exclude: Option<Uuid>,
    ) -> StoreResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            r#"
            SELECT {} FROM bookings
            WHERE owner_id = $1 AND resource_id = $2 AND slot_date = $3
              AND status = ANY($4)
              AND start_time < $6 AND end_time > $5
              AND ($7::uuid IS NULL OR id <> $7)
            ORDER BY start_time
            "#,
            BOOKING_COLUMNS
        ))
        .bind(key.owner_id)
        .bind(key.resource_id)
        .bind(key.date)
        .bind(OCCUPYING)
        .bind(range.start)
        .bind(range.end)
        .bind(exclude)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        into_bookings(rows)
    }

    async fn list_active(&self, owner_id: Uuid, date: NaiveDate) -> StoreResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings WHERE owner_id = $1 AND slot_date = $2 AND status = ANY($3) ORDER BY start_time",
            BOOKING_COLUMNS
        ))
        .bind(owner_id)
        .bind(date)
        .bind(OCCUPYING)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        into_bookings(rows)
    }

    async fn create_booking(&self, booking: &Booking, shares: &[PaymentShare]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            INSERT INTO bookings (id, owner_id, resource_id, slot_date, start_time, end_time, initiator_id, initiator_name,
                                  status, total_cents, paid_cents, payment_deadline, details, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(booking.id)
        .bind(booking.key.owner_id)
        .bind(booking.key.resource_id)
        .bind(booking.key.date)
        .bind(booking.range.start)
        .bind(booking.range.end)
        .bind(&booking.initiator_id)
        .bind(&booking.initiator_name)
        .bind(booking.status.as_str())
        .bind(booking.total_cents)
        .bind(booking.paid_cents)
        .bind(booking.payment_deadline)
        .bind(&booking.details)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        insert_shares(&mut tx, shares).await?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_booking(&self, id: Uuid) -> StoreResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!("SELECT {} FROM bookings WHERE id = $1", BOOKING_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(Booking::try_from).transpose()
    }

    async fn reschedule(
        &self,
        id: Uuid,
        range: &TimeRange,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            r#"
            UPDATE bookings SET start_time = $2, end_time = $3, updated_at = $4
            WHERE id = $1 AND status = ANY($5)
            RETURNING {}
            "#,
            BOOKING_COLUMNS
        ))
        .bind(id)
        .bind(range.start)
        .bind(range.end)
        .bind(at)
        .bind(OCCUPYING)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.map(Booking::try_from).transpose()
    }

    async fn cancel_booking(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        terms: &RefundTerms,
    ) -> StoreResult<Option<(Booking, Option<Refund>)>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            r#"
            UPDATE bookings SET status = 'cancelled', deleted_at = $2, updated_at = $2
            WHERE id = $1 AND status NOT IN ('cancelled', 'expired')
            RETURNING {}
            "#,
            BOOKING_COLUMNS
        ))
        .bind(id)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let booking = Booking::try_from(row)?;

        let refund = terms.for_booking(&booking);
        if let Some(refund) = &refund {
            write_refund(&mut tx, refund).await?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(Some((booking, refund)))
    }

    async fn expire_lapsed(&self, now: DateTime<Utc>) -> StoreResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            r#"
            UPDATE bookings SET status = 'expired', updated_at = $1
            WHERE status = ANY($2) AND payment_deadline IS NOT NULL AND payment_deadline < $1
            RETURNING {}
            "#,
            BOOKING_COLUMNS
        ))
        .bind(now)
        .bind(EXPIRABLE)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        into_bookings(rows)
    }

    async fn insert_refund(&self, refund: &Refund) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        write_refund(&mut conn, refund).await
    }

    async fn list_refunds(&self, booking_id: Uuid) -> StoreResult<Vec<Refund>> {
        let rows: Vec<(Uuid, Uuid, i64, DateTime<Utc>, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, booking_id, amount_cents, expected_by, actor, created_at FROM refunds WHERE booking_id = $1 ORDER BY created_at",
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(rows
            .into_iter()
            .map(|(id, booking_id, amount_cents, expected_by, actor, created_at)| Refund {
                id,
                booking_id,
                amount_cents,
                expected_by,
                actor,
                created_at,
            })
            .collect())
    }
}

#[async_trait]
impl ShareRepository for PgBookingRepository {
    async fn get_share(&self, id: Uuid) -> StoreResult<Option<PaymentShare>> {
        let row = sqlx::query_as::<_, ShareRow>(&format!("SELECT {} FROM payment_shares WHERE id = $1", SHARE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(PaymentShare::from))
    }

    async fn get_share_by_token(&self, token: &str) -> StoreResult<Option<PaymentShare>> {
        let row = sqlx::query_as::<_, ShareRow>(&format!(
            "SELECT {} FROM payment_shares WHERE invite_token = $1",
            SHARE_COLUMNS
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(PaymentShare::from))
    }

    async fn list_shares(&self, booking_id: Uuid) -> StoreResult<Vec<PaymentShare>> {
        let rows = sqlx::query_as::<_, ShareRow>(&format!(
            "SELECT {} FROM payment_shares WHERE booking_id = $1 ORDER BY id",
            SHARE_COLUMNS
        ))
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(PaymentShare::from).collect())
    }

    async fn mark_share_paid(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reference: Option<&str>,
    ) -> StoreResult<ShareMark> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let share: Option<(Uuid,)> = sqlx::query_as("SELECT booking_id FROM payment_shares WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let Some((booking_id,)) = share else {
            return Ok(ShareMark::Missing);
        };

        // The booking row lock orders this against cancel, expiry and split edits.
        let (total_cents, status) = match lock_booking(&mut tx, booking_id).await? {
            Some((total, status)) if !status.is_terminal() => (total, status),
            _ => return Ok(ShareMark::BookingClosed),
        };

        let result = sqlx::query(
            "UPDATE payment_shares SET paid_at = $2, payment_reference = $3 WHERE id = $1 AND paid_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .bind(reference)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Ok(ShareMark::AlreadyPaid);
        }

        // paid_cents moves with the share, so a later expiry or cancel refunds it.
        settle_locked(&mut tx, booking_id, total_cents, status).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(ShareMark::Marked)
    }

    async fn set_share_reference(&self, id: Uuid, reference: &str) -> StoreResult<()> {
        sqlx::query("UPDATE payment_shares SET payment_reference = $2 WHERE id = $1")
            .bind(id)
            .bind(reference)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn replace_unpaid_shares(
        &self,
        booking_id: Uuid,
        expected_paid_cents: i64,
        shares: &[PaymentShare],
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        match lock_booking(&mut tx, booking_id).await? {
            Some((_, status)) if !status.is_terminal() => {}
            _ => return Ok(false),
        }
        if paid_sum(&mut tx, booking_id).await? != expected_paid_cents {
            return Err(StoreError::Conflict { constraint: "payment_shares_paid_changed".into() });
        }

        sqlx::query("DELETE FROM payment_shares WHERE booking_id = $1 AND paid_at IS NULL")
            .bind(booking_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        insert_shares(&mut tx, shares).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(true)
    }

    async fn refresh_payment_state(&self, booking_id: Uuid) -> StoreResult<Option<Booking>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let Some((total_cents, status)) = lock_booking(&mut tx, booking_id).await? else {
            return Ok(None);
        };
        let booking = settle_locked(&mut tx, booking_id, total_cents, status).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(Some(booking))
    }
}
