use chrono::{NaiveDate, NaiveTime};
use rally_core::{
    BookingRepository, BookingStatus, CoreError, CoreResult, EventPublisher, PaymentShare,
    RetryPolicy, ShareMark, ShareRepository,
};
use rally_shared::SlotEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::SlotCache;
use crate::SharedClock;

/// How a payer points at their share: by id from an authenticated session,
/// or by the invite token from a payment link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareLocator {
    ShareId(Uuid),
    InviteToken(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentOutcome {
    pub booking_id: Uuid,
    pub share_id: Uuid,
    pub paid_cents: i64,
    pub status: BookingStatus,
}

/// Booking fields safe to show someone holding only an invite link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicBooking {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub total_cents: i64,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invite {
    pub share: PaymentShare,
    pub booking: PublicBooking,
}

/// Settles payment shares. The only writer of a booking's paid amount and
/// status after confirmation, short of cancellation and expiry.
pub struct PaymentLedger {
    shares: Arc<dyn ShareRepository>,
    bookings: Arc<dyn BookingRepository>,
    cache: Arc<SlotCache>,
    events: Arc<dyn EventPublisher>,
    clock: SharedClock,
    retry: RetryPolicy,
}

impl PaymentLedger {
    pub fn new(
        shares: Arc<dyn ShareRepository>,
        bookings: Arc<dyn BookingRepository>,
        cache: Arc<SlotCache>,
        events: Arc<dyn EventPublisher>,
        clock: SharedClock,
        retry: RetryPolicy,
    ) -> Self {
        Self { shares, bookings, cache, events, clock, retry }
    }

    async fn locate(&self, locator: &ShareLocator) -> CoreResult<PaymentShare> {
        let share = match locator {
            ShareLocator::ShareId(id) => self.shares.get_share(*id).await?,
            ShareLocator::InviteToken(token) => self.shares.get_share_by_token(token).await?,
        };
        share.ok_or_else(|| CoreError::NotFound("payment share".into()))
    }

    /// Mark a share paid and recompute its booking. Paying an already paid
    /// share changes nothing except, when given, its reference.
    pub async fn record_payment(
        &self,
        locator: ShareLocator,
        reference: Option<String>,
    ) -> CoreResult<PaymentOutcome> {
        let share = self.locate(&locator).await?;
        let booking = self
            .bookings
            .get_booking(share.booking_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", share.booking_id)))?;

        if share.is_paid() {
            if let Some(reference) = reference.as_deref() {
                if share.payment_reference.as_deref() != Some(reference) {
                    self.shares.set_share_reference(share.id, reference).await?;
                }
            }
            debug!(share_id = %share.id, "share already paid");
            return Ok(PaymentOutcome {
                booking_id: booking.id,
                share_id: share.id,
                paid_cents: booking.paid_cents,
                status: booking.status,
            });
        }

        if booking.status.is_terminal() {
            return Err(CoreError::InvalidState(format!("booking is {}", booking.status)));
        }

        let now = self.clock.utc();
        // The store re-checks the booking under its row lock; the status read
        // above may already be stale.
        let mark = self
            .retry
            .run("mark_share_paid", || self.shares.mark_share_paid(share.id, now, reference.as_deref()))
            .await?;
        match mark {
            ShareMark::Marked => {}
            ShareMark::AlreadyPaid => debug!(share_id = %share.id, "share settled concurrently"),
            ShareMark::BookingClosed => {
                return Err(CoreError::InvalidState(format!("booking {} closed before payment", share.booking_id)))
            }
            ShareMark::Missing => return Err(CoreError::NotFound("payment share".into())),
        }

        let booking = self
            .retry
            .run("refresh_payment_state", || self.shares.refresh_payment_state(share.booking_id))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", share.booking_id)))?;

        self.cache.invalidate(booking.key.owner_id, booking.key.date).await;
        info!(booking_id = %booking.id, share_id = %share.id, paid_cents = booking.paid_cents, status = %booking.status, "payment recorded");
        self.events
            .publish(&SlotEvent::PaymentRecorded {
                booking_id: booking.id,
                share_id: share.id,
                paid_cents: booking.paid_cents,
                status: booking.status.to_string(),
            })
            .await;

        Ok(PaymentOutcome {
            booking_id: booking.id,
            share_id: share.id,
            paid_cents: booking.paid_cents,
            status: booking.status,
        })
    }

    pub async fn invite(&self, token: &str) -> CoreResult<Invite> {
        let share = self.locate(&ShareLocator::InviteToken(token.to_string())).await?;
        let booking = self
            .bookings
            .get_booking(share.booking_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", share.booking_id)))?;
        Ok(Invite {
            booking: PublicBooking {
                id: booking.id,
                resource_id: booking.key.resource_id,
                date: booking.key.date,
                start: booking.range.start,
                end: booking.range.end,
                total_cents: booking.total_cents,
                status: booking.status,
            },
            share,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ConfirmRequest;
    use crate::locks::HoldRequest;
    use crate::test_support::{key, range, Harness};
    use crate::engine::Stores;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use rally_core::{Booking, SplitEntry, StoreError, StoreResult};
    use rally_store::FailPoint;

    /// Runs the sweeper's booking expiry right before the next share write,
    /// as if the payment window lapsed mid-request.
    struct ExpiryBeforeMark {
        inner: Arc<dyn ShareRepository>,
        bookings: Arc<dyn BookingRepository>,
    }

    #[async_trait]
    impl ShareRepository for ExpiryBeforeMark {
        async fn get_share(&self, id: Uuid) -> StoreResult<Option<PaymentShare>> {
            self.inner.get_share(id).await
        }

        async fn get_share_by_token(&self, token: &str) -> StoreResult<Option<PaymentShare>> {
            self.inner.get_share_by_token(token).await
        }

        async fn list_shares(&self, booking_id: Uuid) -> StoreResult<Vec<PaymentShare>> {
            self.inner.list_shares(booking_id).await
        }

        async fn mark_share_paid(&self, id: Uuid, at: DateTime<Utc>, reference: Option<&str>) -> StoreResult<ShareMark> {
            self.bookings.expire_lapsed(at + Duration::days(365)).await?;
            self.inner.mark_share_paid(id, at, reference).await
        }

        async fn set_share_reference(&self, id: Uuid, reference: &str) -> StoreResult<()> {
            self.inner.set_share_reference(id, reference).await
        }

        async fn replace_unpaid_shares(
            &self,
            booking_id: Uuid,
            expected_paid_cents: i64,
            shares: &[PaymentShare],
        ) -> StoreResult<bool> {
            self.inner.replace_unpaid_shares(booking_id, expected_paid_cents, shares).await
        }

        async fn refresh_payment_state(&self, booking_id: Uuid) -> StoreResult<Option<Booking>> {
            self.inner.refresh_payment_state(booking_id).await
        }
    }

    async fn split_booking(h: &Harness, amounts: &[i64]) -> (Uuid, Vec<PaymentShare>) {
        let hold = h
            .engine
            .locks
            .acquire(HoldRequest { key: key(), range: range(18, 19), holder_id: "member-1".into(), hold_minutes: None })
            .await
            .unwrap();
        let confirmation = h
            .engine
            .confirmer
            .confirm(ConfirmRequest {
                lock_id: hold.id,
                key: key(),
                range: range(18, 19),
                payer_id: "member-1".into(),
                payer_name: "Ana".into(),
                total_cents: amounts.iter().sum(),
                split_plan: amounts.iter().map(|&a| SplitEntry { payer: None, amount_cents: a }).collect(),
                idempotency_key: None,
                details: serde_json::json!({}),
            })
            .await
            .unwrap();
        (confirmation.booking.id, confirmation.shares.into_iter().map(|v| v.share).collect())
    }

    #[tokio::test]
    async fn paying_twice_does_not_double_count() {
        let h = Harness::new();
        let (booking_id, shares) = split_booking(&h, &[4_000, 6_000]).await;

        let first = h.engine.payments.record_payment(ShareLocator::ShareId(shares[0].id), None).await.unwrap();
        let again = h
            .engine
            .payments
            .record_payment(ShareLocator::ShareId(shares[0].id), Some("psp-123".into()))
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(again.paid_cents, 4_000);
        assert_eq!(again.status, BookingStatus::PartiallyPaid);
        let stored = h.store.shares().await.into_iter().find(|s| s.id == shares[0].id).unwrap();
        assert_eq!(stored.payment_reference.as_deref(), Some("psp-123"));
        assert_eq!(h.store.bookings().await[0].id, booking_id);
    }

    #[tokio::test]
    async fn invite_token_settles_its_share() {
        let h = Harness::new();
        let (_, shares) = split_booking(&h, &[5_000, 5_000]).await;
        let token = shares[1].invite_token.clone().unwrap();

        let invite = h.engine.payments.invite(&token).await.unwrap();
        assert_eq!(invite.share.id, shares[1].id);
        assert_eq!(invite.booking.total_cents, 10_000);
        assert_eq!(invite.booking.status, BookingStatus::PendingPayments);

        let outcome = h.engine.payments.record_payment(ShareLocator::InviteToken(token), None).await.unwrap();
        assert_eq!(outcome.share_id, shares[1].id);
        assert_eq!(outcome.paid_cents, 5_000);
    }

    #[tokio::test]
    async fn unknown_share_is_not_found() {
        let h = Harness::new();
        let err = h
            .engine
            .payments
            .record_payment(ShareLocator::InviteToken("nope".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(matches!(h.engine.payments.invite("nope").await, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn paid_amount_always_equals_sum_of_paid_shares() {
        let h = Harness::new();
        let (booking_id, shares) = split_booking(&h, &[2_500, 2_500, 5_000]).await;
        let mut last = BookingStatus::PendingPayments;

        for (i, share) in shares.iter().enumerate() {
            let outcome = h.engine.payments.record_payment(ShareLocator::ShareId(share.id), None).await.unwrap();
            let expected: i64 = shares[..=i].iter().map(|s| s.amount_cents).sum();
            assert_eq!(outcome.paid_cents, expected);
            assert!(status_rank(outcome.status) >= status_rank(last));
            last = outcome.status;
        }

        let booking = h.store.bookings().await.into_iter().find(|b| b.id == booking_id).unwrap();
        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert_eq!(booking.paid_cents, booking.total_cents);
    }

    #[tokio::test]
    async fn transient_failure_while_marking_is_retried() {
        let h = Harness::new();
        let (_, shares) = split_booking(&h, &[4_000, 6_000]).await;
        h.store.fail_next(FailPoint::MarkSharePaid, StoreError::Transient("deadlock detected".into())).await;

        let outcome = h.engine.payments.record_payment(ShareLocator::ShareId(shares[1].id), None).await.unwrap();
        assert_eq!(outcome.paid_cents, 6_000);
    }

    #[tokio::test]
    async fn payment_landing_after_expiry_is_refused() {
        let h = Harness::with_stores(|stores| Stores {
            shares: Arc::new(ExpiryBeforeMark { inner: stores.shares.clone(), bookings: stores.bookings.clone() }),
            ..stores
        });
        let (booking_id, shares) = split_booking(&h, &[4_000, 6_000]).await;

        let err = h.engine.payments.record_payment(ShareLocator::ShareId(shares[0].id), None).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));

        let booking = h.store.bookings().await.into_iter().find(|b| b.id == booking_id).unwrap();
        assert_eq!(booking.status, BookingStatus::Expired);
        assert_eq!(booking.paid_cents, 0);
        assert!(h.store.shares().await.iter().all(|s| !s.is_paid()));
    }

    fn status_rank(status: BookingStatus) -> u8 {
        match status {
            BookingStatus::PendingPayments => 0,
            BookingStatus::PartiallyPaid => 1,
            BookingStatus::Confirmed => 2,
            _ => 3,
        }
    }
}
