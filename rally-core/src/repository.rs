use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{
    Booking, Hold, IdempotencyRecord, PaymentShare, Refund, RefundTerms, SlotKey, TimeRange,
};

/// Store failures, classified once where the driver error is observed.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum StoreError {
    /// A uniqueness or exclusion constraint rejected the write.
    #[error("constraint violated: {constraint}")]
    Conflict { constraint: String },
    /// Deadlock, serialization failure or pool exhaustion; safe to retry.
    #[error("transient store contention: {0}")]
    Transient(String),
    #[error("store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for holds. Implementations must reject, with
/// [`StoreError::Conflict`], an insert overlapping any stored hold of the same
/// [`SlotKey`]; that rejection is the race backstop behind the conflict check.
#[async_trait]
pub trait HoldRepository: Send + Sync {
    async fn insert_hold(&self, hold: &Hold) -> StoreResult<()>;

    async fn get_hold(&self, id: Uuid) -> StoreResult<Option<Hold>>;

    /// Holds of `key` overlapping `range` whose expiry is after `now`.
    async fn find_active_overlapping(
        &self,
        key: &SlotKey,
        range: &TimeRange,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Hold>>;

    /// Non-expired holds of a club for one day, ordered by start time.
    async fn list_active(
        &self,
        owner_id: Uuid,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Hold>>;

    /// Stamp a hold with the booking it produced. `false` when the hold is gone.
    async fn mark_converted(&self, id: Uuid, booking_id: Uuid) -> StoreResult<bool>;

    /// Delete a hold, returning it when something was removed.
    async fn delete_hold(&self, id: Uuid) -> StoreResult<Option<Hold>>;

    async fn delete_for_booking(&self, booking_id: Uuid) -> StoreResult<Vec<Hold>>;

    /// Delete every hold with `expires_at < now`, returning what was removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<Hold>>;
}

/// Persistence for bookings and refunds. Implementations must reject, with
/// [`StoreError::Conflict`], any write that would make two occupying bookings
/// of the same [`SlotKey`] overlap.
#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Occupying bookings of `key` overlapping `range`, minus `exclude`.
    async fn find_active_overlapping(
        &self,
        key: &SlotKey,
        range: &TimeRange,
        exclude: Option<Uuid>,
    ) -> StoreResult<Vec<Booking>>;

    /// Occupying bookings of a club for one day, ordered by start time.
    async fn list_active(&self, owner_id: Uuid, date: NaiveDate) -> StoreResult<Vec<Booking>>;

    /// Insert a booking together with its shares, atomically.
    async fn create_booking(&self, booking: &Booking, shares: &[PaymentShare]) -> StoreResult<()>;

    async fn get_booking(&self, id: Uuid) -> StoreResult<Option<Booking>>;

    /// Move an occupying booking to a new range on the same day.
    async fn reschedule(
        &self,
        id: Uuid,
        range: &TimeRange,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Booking>>;

    /// Cancel a non-terminal booking, setting the soft-delete marker, and in
    /// the same transaction record the refund `terms` yield for what it had
    /// been paid. `None` when the booking is missing or already terminal.
    async fn cancel_booking(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        terms: &RefundTerms,
    ) -> StoreResult<Option<(Booking, Option<Refund>)>>;

    /// Move every expirable booking whose payment deadline is before `now`
    /// to `expired`, returning the bookings that changed.
    async fn expire_lapsed(&self, now: DateTime<Utc>) -> StoreResult<Vec<Booking>>;

    async fn insert_refund(&self, refund: &Refund) -> StoreResult<()>;

    async fn list_refunds(&self, booking_id: Uuid) -> StoreResult<Vec<Refund>>;
}

/// Result of settling a single share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMark {
    Marked,
    AlreadyPaid,
    /// The parent booking is cancelled or expired; nothing was written.
    BookingClosed,
    Missing,
}

/// Persistence for payment shares.
#[async_trait]
pub trait ShareRepository: Send + Sync {
    async fn get_share(&self, id: Uuid) -> StoreResult<Option<PaymentShare>>;

    async fn get_share_by_token(&self, token: &str) -> StoreResult<Option<PaymentShare>>;

    async fn list_shares(&self, booking_id: Uuid) -> StoreResult<Vec<PaymentShare>>;

    /// Set `paid_at` on an unpaid share of a live booking. Serialized with
    /// cancellation, expiry and split edits of the same booking.
    async fn mark_share_paid(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reference: Option<&str>,
    ) -> StoreResult<ShareMark>;

    /// Update the payment reference of an already paid share.
    async fn set_share_reference(&self, id: Uuid, reference: &str) -> StoreResult<()>;

    /// Replace every unpaid share of a live booking with `shares`, provided its
    /// paid shares still sum to `expected_paid_cents`. Paid shares are left
    /// untouched. A changed paid sum is reported as [`StoreError::Conflict`];
    /// `false` when the booking is missing or terminal.
    async fn replace_unpaid_shares(
        &self,
        booking_id: Uuid,
        expected_paid_cents: i64,
        shares: &[PaymentShare],
    ) -> StoreResult<bool>;

    /// Recompute a booking's paid amount from its paid shares and derive its
    /// status with [`crate::BookingStatus::from_payment`], under a row lock.
    /// Terminal bookings keep their status. Returns the updated booking.
    async fn refresh_payment_state(&self, booking_id: Uuid) -> StoreResult<Option<Booking>>;
}

#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Record for `key` created at or after `not_before`.
    async fn find(
        &self,
        key: &str,
        not_before: DateTime<Utc>,
    ) -> StoreResult<Option<IdempotencyRecord>>;

    /// Insert a record; a duplicate key is reported as [`StoreError::Conflict`].
    async fn insert(&self, record: &IdempotencyRecord) -> StoreResult<()>;

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}
