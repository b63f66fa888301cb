//! In-process implementation of every repository port.
//!
//! Mirrors the Postgres schema's constraints (hold overlap exclusion,
//! occupying-booking overlap exclusion, unique idempotency keys and invite
//! tokens) so engine behaviour under races is the same on both backends.
//! Backs the test suites and `store.kind = "memory"` local runs.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rally_core::{
    Booking, BookingRepository, BookingStatus, ClubConfig, ConfigProvider, Hold, HoldRepository,
    IdempotencyRecord, IdempotencyRepository, PaymentShare, Refund, RefundTerms, ShareMark,
    ShareRepository, SlotKey, StoreError, StoreResult, TimeRange,
};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Operations that can be told to fail once, for exercising error paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    InsertHold,
    CreateBooking,
    CancelBooking,
    MarkConverted,
    MarkSharePaid,
    InsertIdempotency,
    ExpireHolds,
    ExpireBookings,
    GetConfig,
}

#[derive(Default)]
struct MemoryState {
    holds: HashMap<Uuid, Hold>,
    bookings: HashMap<Uuid, Booking>,
    shares: HashMap<Uuid, PaymentShare>,
    refunds: Vec<Refund>,
    idempotency: HashMap<String, IdempotencyRecord>,
    configs: HashMap<Uuid, ClubConfig>,
    failures: Vec<(FailPoint, StoreError)>,
}

impl MemoryState {
    fn take_failure(&mut self, point: FailPoint) -> StoreResult<()> {
        match self.failures.iter().position(|(p, _)| *p == point) {
            Some(idx) => Err(self.failures.remove(idx).1),
            None => Ok(()),
        }
    }

    fn paid_cents(&self, booking_id: Uuid) -> i64 {
        self.shares
            .values()
            .filter(|s| s.booking_id == booking_id && s.paid_at.is_some())
            .map(|s| s.amount_cents)
            .sum()
    }

    /// Write a booking's paid sum back onto it. Terminal bookings keep their
    /// status.
    fn settle(&mut self, booking_id: Uuid) -> Option<Booking> {
        let paid = self.paid_cents(booking_id);
        self.bookings.get_mut(&booking_id).map(|b| {
            b.paid_cents = paid;
            if !b.status.is_terminal() {
                b.status = BookingStatus::from_payment(paid, b.total_cents);
            }
            b.clone()
        })
    }

    fn booking_overlaps(&self, key: &SlotKey, range: &TimeRange, exclude: Option<Uuid>) -> bool {
        self.bookings.values().any(|b| {
            Some(b.id) != exclude
                && b.key == *key
                && b.status.is_occupying()
                && b.range.overlaps(range)
        })
    }
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    defaults: ClubConfig,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_defaults(ClubConfig::default())
    }

    pub fn with_defaults(defaults: ClubConfig) -> Self {
        Self { state: Mutex::new(MemoryState::default()), defaults }
    }

    pub async fn set_config(&self, owner_id: Uuid, config: ClubConfig) {
        self.state.lock().await.configs.insert(owner_id, config);
    }

    /// Make the next call at `point` fail with `error`.
    pub async fn fail_next(&self, point: FailPoint, error: StoreError) {
        self.state.lock().await.failures.push((point, error));
    }

    pub async fn holds(&self) -> Vec<Hold> {
        let mut holds: Vec<Hold> = self.state.lock().await.holds.values().cloned().collect();
        holds.sort_by_key(|h| (h.key.date, h.range.start));
        holds
    }

    pub async fn bookings(&self) -> Vec<Booking> {
        let mut bookings: Vec<Booking> =
            self.state.lock().await.bookings.values().cloned().collect();
        bookings.sort_by_key(|b| (b.key.date, b.range.start, b.created_at));
        bookings
    }

    pub async fn shares(&self) -> Vec<PaymentShare> {
        self.state.lock().await.shares.values().cloned().collect()
    }

    pub async fn refunds(&self) -> Vec<Refund> {
        self.state.lock().await.refunds.clone()
    }

    pub async fn idempotency_records(&self) -> Vec<IdempotencyRecord> {
        self.state.lock().await.idempotency.values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_by_start<T, F>(mut items: Vec<T>, start: F) -> Vec<T>
where
    F: Fn(&T) -> chrono::NaiveTime,
{
    items.sort_by_key(|i| start(i));
    items
}

#[async_trait]
impl HoldRepository for MemoryStore {
    async fn insert_hold(&self, hold: &Hold) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.take_failure(FailPoint::InsertHold)?;
        // Same scope as the `holds_no_overlap` exclusion constraint: expired
        // rows still block until the sweeper deletes them.
        let clash = state
            .holds
            .values()
            .any(|h| h.key == hold.key && h.range.overlaps(&hold.range));
        if clash {
            return Err(StoreError::Conflict { constraint: "holds_no_overlap".into() });
        }
        state.holds.insert(hold.id, hold.clone());
        Ok(())
    }

    async fn get_hold(&self, id: Uuid) -> StoreResult<Option<Hold>> {
        Ok(self.state.lock().await.holds.get(&id).cloned())
    }

    async fn find_active_overlapping(
        &self,
        key: &SlotKey,
        range: &TimeRange,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Hold>> {
        let state = self.state.lock().await;
        let found = state
            .holds
            .values()
            .filter(|h| h.key == *key && h.is_active_at(now) && h.range.overlaps(range))
            .cloned()
            .collect();
        Ok(sorted_by_start(found, |h: &Hold| h.range.start))
    }

    async fn list_active(
        &self,
        owner_id: Uuid,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Hold>> {
        let state = self.state.lock().await;
        let found = state
            .holds
            .values()
            .filter(|h| h.key.owner_id == owner_id && h.key.date == date && h.is_active_at(now))
            .cloned()
            .collect();
        Ok(sorted_by_start(found, |h: &Hold| h.range.start))
    }

    async fn mark_converted(&self, id: Uuid, booking_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        state.take_failure(FailPoint::MarkConverted)?;
        match state.holds.get_mut(&id) {
            Some(hold) => {
                hold.booking_id = Some(booking_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_hold(&self, id: Uuid) -> StoreResult<Option<Hold>> {
        Ok(self.state.lock().await.holds.remove(&id))
    }

    async fn delete_for_booking(&self, booking_id: Uuid) -> StoreResult<Vec<Hold>> {
        let mut state = self.state.lock().await;
        let ids: Vec<Uuid> = state
            .holds
            .values()
            .filter(|h| h.booking_id == Some(booking_id))
            .map(|h| h.id)
            .collect();
        Ok(ids.iter().filter_map(|id| state.holds.remove(id)).collect())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<Hold>> {
        let mut state = self.state.lock().await;
        state.take_failure(FailPoint::ExpireHolds)?;
        let ids: Vec<Uuid> = state
            .holds
            .values()
            .filter(|h| h.expires_at < now)
            .map(|h| h.id)
            .collect();
        Ok(ids.iter().filter_map(|id| state.holds.remove(id)).collect())
    }
}

#[async_trait]
impl BookingRepository for MemoryStore {
    async fn find_active_overlapping(
        &self,
        key: &SlotKey,
        range: &TimeRange,
        exclude: Option<Uuid>,
    ) -> StoreResult<Vec<Booking>> {
        let state = self.state.lock().await;
        let found = state
            .bookings
            .values()
            .filter(|b| {
                Some(b.id) != exclude
                    && b.key == *key
                    && b.status.is_occupying()
                    && b.range.overlaps(range)
            })
            .cloned()
            .collect();
        Ok(sorted_by_start(found, |b: &Booking| b.range.start))
    }

    async fn list_active(&self, owner_id: Uuid, date: NaiveDate) -> StoreResult<Vec<Booking>> {
        let state = self.state.lock().await;
        let found = state
            .bookings
            .values()
            .filter(|b| b.key.owner_id == owner_id && b.key.date == date && b.status.is_occupying())
            .cloned()
            .collect();
        Ok(sorted_by_start(found, |b: &Booking| b.range.start))
    }

    async fn create_booking(&self, booking: &Booking, shares: &[PaymentShare]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.take_failure(FailPoint::CreateBooking)?;
        if state.bookings.contains_key(&booking.id) {
            return Err(StoreError::Conflict { constraint: "bookings_pkey".into() });
        }
        if booking.status.is_occupying() && state.booking_overlaps(&booking.key, &booking.range, None) {
            return Err(StoreError::Conflict { constraint: "bookings_no_overlap".into() });
        }
        let token_clash = shares.iter().filter_map(|s| s.invite_token.as_ref()).any(|token| {
            state.shares.values().any(|s| s.invite_token.as_ref() == Some(token))
        });
        if token_clash {
            return Err(StoreError::Conflict { constraint: "payment_shares_invite_token_key".into() });
        }
        state.bookings.insert(booking.id, booking.clone());
        for share in shares {
            state.shares.insert(share.id, share.clone());
        }
        Ok(())
    }

    async fn get_booking(&self, id: Uuid) -> StoreResult<Option<Booking>> {
        Ok(self.state.lock().await.bookings.get(&id).cloned())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        range: &TimeRange,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Booking>> {
        let mut state = self.state.lock().await;
        let key = match state.bookings.get(&id) {
            Some(b) if b.status.is_occupying() => b.key,
            _ => return Ok(None),
        };
        if state.booking_overlaps(&key, range, Some(id)) {
            return Err(StoreError::Conflict { constraint: "bookings_no_overlap".into() });
        }
        Ok(state.bookings.get_mut(&id).map(|b| {
            b.range = *range;
            b.updated_at = at;
            b.clone()
        }))
    }

    async fn cancel_booking(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        terms: &RefundTerms,
    ) -> StoreResult<Option<(Booking, Option<Refund>)>> {
        let mut state = self.state.lock().await;
        state.take_failure(FailPoint::CancelBooking)?;
        let cancelled = state.bookings.get_mut(&id).filter(|b| !b.status.is_terminal()).map(|b| {
            b.status = BookingStatus::Cancelled;
            b.deleted_at = Some(at);
            b.updated_at = at;
            b.clone()
        });
        let Some(booking) = cancelled else {
            return Ok(None);
        };
        let refund = terms.for_booking(&booking);
        if let Some(refund) = &refund {
            state.refunds.push(refund.clone());
        }
        Ok(Some((booking, refund)))
    }

    async fn expire_lapsed(&self, now: DateTime<Utc>) -> StoreResult<Vec<Booking>> {
        let mut state = self.state.lock().await;
        state.take_failure(FailPoint::ExpireBookings)?;
        let mut expired = Vec::new();
        for booking in state.bookings.values_mut() {
            let lapsed = booking.payment_deadline.is_some_and(|deadline| deadline < now);
            if booking.status.is_expirable() && lapsed {
                booking.status = BookingStatus::Expired;
                booking.updated_at = now;
                expired.push(booking.clone());
            }
        }
        Ok(expired)
    }

    async fn insert_refund(&self, refund: &Refund) -> StoreResult<()> {
        self.state.lock().await.refunds.push(refund.clone());
        Ok(())
    }

    async fn list_refunds(&self, booking_id: Uuid) -> StoreResult<Vec<Refund>> {
        let state = self.state.lock().await;
        Ok(state.refunds.iter().filter(|r| r.booking_id == booking_id).cloned().collect())
    }
}

#[async_trait]
impl ShareRepository for MemoryStore {
    async fn get_share(&self, id: Uuid) -> StoreResult<Option<PaymentShare>> {
        Ok(self.state.lock().await.shares.get(&id).cloned())
    }

    async fn get_share_by_token(&self, token: &str) -> StoreResult<Option<PaymentShare>> {
        let state = self.state.lock().await;
        Ok(state.shares.values().find(|s| s.invite_token.as_deref() == Some(token)).cloned())
    }

    async fn list_shares(&self, booking_id: Uuid) -> StoreResult<Vec<PaymentShare>> {
        let state = self.state.lock().await;
        let mut shares: Vec<PaymentShare> =
            state.shares.values().filter(|s| s.booking_id == booking_id).cloned().collect();
        shares.sort_by_key(|s| s.id);
        Ok(shares)
    }

    async fn mark_share_paid(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reference: Option<&str>,
    ) -> StoreResult<ShareMark> {
        let mut state = self.state.lock().await;
        state.take_failure(FailPoint::MarkSharePaid)?;
        let booking_id = match state.shares.get(&id) {
            None => return Ok(ShareMark::Missing),
            Some(share) if share.paid_at.is_some() => return Ok(ShareMark::AlreadyPaid),
            Some(share) => share.booking_id,
        };
        let live = state.bookings.get(&booking_id).is_some_and(|b| !b.status.is_terminal());
        if !live {
            return Ok(ShareMark::BookingClosed);
        }
        if let Some(share) = state.shares.get_mut(&id) {
            share.paid_at = Some(at);
            share.payment_reference = reference.map(str::to_string);
        }
        state.settle(booking_id);
        Ok(ShareMark::Marked)
    }

    async fn set_share_reference(&self, id: Uuid, reference: &str) -> StoreResult<()> {
        if let Some(share) = self.state.lock().await.shares.get_mut(&id) {
            share.payment_reference = Some(reference.to_string());
        }
        Ok(())
    }

    async fn replace_unpaid_shares(
        &self,
        booking_id: Uuid,
        expected_paid_cents: i64,
        shares: &[PaymentShare],
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let live = state.bookings.get(&booking_id).is_some_and(|b| !b.status.is_terminal());
        if !live {
            return Ok(false);
        }
        if state.paid_cents(booking_id) != expected_paid_cents {
            return Err(StoreError::Conflict { constraint: "payment_shares_paid_changed".into() });
        }
        state.shares.retain(|_, s| s.booking_id != booking_id || s.paid_at.is_some());
        for share in shares {
            state.shares.insert(share.id, share.clone());
        }
        Ok(true)
    }

    async fn refresh_payment_state(&self, booking_id: Uuid) -> StoreResult<Option<Booking>> {
        Ok(self.state.lock().await.settle(booking_id))
    }
}

#[async_trait]
impl IdempotencyRepository for MemoryStore {
    async fn find(
        &self,
        key: &str,
        not_before: DateTime<Utc>,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let state = self.state.lock().await;
        Ok(state.idempotency.get(key).filter(|r| r.created_at >= not_before).cloned())
    }

    async fn insert(&self, record: &IdempotencyRecord) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.take_failure(FailPoint::InsertIdempotency)?;
        if state.idempotency.contains_key(&record.key) {
            return Err(StoreError::Conflict { constraint: "idempotency_records_pkey".into() });
        }
        state.idempotency.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, r| r.created_at >= cutoff);
        Ok((before - state.idempotency.len()) as u64)
    }
}

#[async_trait]
impl ConfigProvider for MemoryStore {
    async fn get_config(&self, owner_id: Uuid) -> StoreResult<ClubConfig> {
        let mut state = self.state.lock().await;
        state.take_failure(FailPoint::GetConfig)?;
        Ok(state.configs.get(&owner_id).cloned().unwrap_or_else(|| self.defaults.clone()))
    }
}
