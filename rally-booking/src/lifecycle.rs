use chrono::Duration;
use rally_core::{
    Booking, BookingRepository, BookingStatus, ConfigProvider, Conflict, ConflictKind, CoreError,
    CoreResult, EventPublisher, Refund, RefundTerms, RetryPolicy, ShareRepository, SplitEntry,
    StoreError, TimeRange,
};
use rally_shared::SlotEvent;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::SlotCache;
use crate::confirm::{build_shares, share_views, validate_plan, ShareView};
use crate::conflict::ConflictDetector;
use crate::locks::LockManager;
use crate::{offset_by, SharedClock};

/// Actor recorded on refunds raised by payment-window expiry.
pub const SWEEPER_ACTOR: &str = "system:sweeper";

#[derive(Debug, Clone, Serialize)]
pub struct Cancellation {
    pub booking: Booking,
    pub refund: Option<Refund>,
}

/// Everything that happens to a booking after confirmation besides payment.
pub struct BookingLifecycle {
    bookings: Arc<dyn BookingRepository>,
    shares: Arc<dyn ShareRepository>,
    config: Arc<dyn ConfigProvider>,
    detector: Arc<ConflictDetector>,
    locks: Arc<LockManager>,
    cache: Arc<SlotCache>,
    events: Arc<dyn EventPublisher>,
    clock: SharedClock,
    retry: RetryPolicy,
    link_base: String,
}

impl BookingLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        shares: Arc<dyn ShareRepository>,
        config: Arc<dyn ConfigProvider>,
        detector: Arc<ConflictDetector>,
        locks: Arc<LockManager>,
        cache: Arc<SlotCache>,
        events: Arc<dyn EventPublisher>,
        clock: SharedClock,
        retry: RetryPolicy,
        link_base: String,
    ) -> Self {
        Self { bookings, shares, config, detector, locks, cache, events, clock, retry, link_base }
    }

    async fn load(&self, booking_id: Uuid) -> CoreResult<Booking> {
        self.bookings
            .get_booking(booking_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", booking_id)))
    }

    pub async fn get(&self, booking_id: Uuid) -> CoreResult<(Booking, Vec<ShareView>)> {
        let booking = self.load(booking_id).await?;
        let shares = self.shares.list_shares(booking_id).await?;
        Ok((booking, share_views(&self.link_base, shares)))
    }

    /// Cancel a live booking. Anything already paid is queued for refund
    /// within the club's refund window, in the same write as the cancellation.
    pub async fn cancel(&self, booking_id: Uuid, actor: &str) -> CoreResult<Cancellation> {
        let booking = self.load(booking_id).await?;
        if booking.status.is_terminal() {
            return Err(CoreError::InvalidState(format!("booking is already {}", booking.status)));
        }

        let terms = self.refund_terms(booking.key.owner_id, actor).await?;
        let (booking, refund) = self
            .retry
            .run("cancel_booking", || self.bookings.cancel_booking(booking_id, terms.created_at, &terms))
            .await?
            .ok_or_else(|| CoreError::InvalidState("booking was closed concurrently".into()))?;

        // A leftover converted hold is removed by the sweeper once it expires.
        if let Err(err) = self.locks.release_for_booking(booking_id).await {
            warn!(%booking_id, error = %err, "failed to release holds of cancelled booking");
        }
        if let Some(refund) = &refund {
            info!(%booking_id, amount_cents = refund.amount_cents, "refund queued");
        }

        self.cache.invalidate(booking.key.owner_id, booking.key.date).await;
        info!(%booking_id, actor, refund_cents = booking.paid_cents, "booking cancelled");
        self.events
            .publish(&SlotEvent::BookingCancelled {
                booking_id,
                owner_id: booking.key.owner_id,
                refund_cents: refund.as_ref().map_or(0, |r| r.amount_cents),
                actor: actor.to_string(),
            })
            .await;

        Ok(Cancellation { booking, refund })
    }

    /// Move a live booking within its day. Its own range does not count as a
    /// conflict.
    pub async fn reschedule(&self, booking_id: Uuid, range: TimeRange) -> CoreResult<Booking> {
        let booking = self.load(booking_id).await?;
        if !booking.status.is_occupying() {
            return Err(CoreError::InvalidState(format!("booking is {}", booking.status)));
        }

        if let Some(conflict) = self.detector.has_conflict(&booking.key, &range, Some(booking_id)).await? {
            return Err(CoreError::SlotTaken(conflict));
        }

        let now = self.clock.utc();
        let moved = match self
            .retry
            .run("reschedule", || self.bookings.reschedule(booking_id, &range, now))
            .await
        {
            Ok(moved) => moved,
            Err(StoreError::Conflict { .. }) => {
                return Err(CoreError::SlotTaken(Conflict::raced(ConflictKind::Booking)))
            }
            Err(err) => return Err(err.into()),
        };
        let booking = moved.ok_or_else(|| CoreError::InvalidState("booking was closed concurrently".into()))?;

        self.cache.invalidate(booking.key.owner_id, booking.key.date).await;
        info!(%booking_id, start = %range.start, end = %range.end, "booking rescheduled");
        self.events
            .publish(&SlotEvent::BookingRescheduled {
                booking_id,
                owner_id: booking.key.owner_id,
                start: range.start,
                end: range.end,
            })
            .await;
        Ok(booking)
    }

    /// Replace the unpaid part of a split plan. Allowed for
    /// `split_manage_minutes` after creation; paid shares stay as they are and
    /// payers already invited keep their link.
    pub async fn update_split_plan(&self, booking_id: Uuid, plan: Vec<SplitEntry>) -> CoreResult<Vec<ShareView>> {
        let booking = self.load(booking_id).await?;
        if !matches!(booking.status, BookingStatus::PendingPayments | BookingStatus::PartiallyPaid) {
            return Err(CoreError::InvalidState(format!("split of a {} booking cannot change", booking.status)));
        }
        let config = self.config.get_config(booking.key.owner_id).await?;
        let window_end = offset_by(
            booking.created_at,
            Duration::try_minutes(config.split_manage_minutes),
            "split_manage_minutes",
        )?;
        if self.clock.utc() > window_end {
            return Err(CoreError::InvalidState("split management window has closed".into()));
        }

        let existing = self.shares.list_shares(booking_id).await?;
        let paid_cents: i64 = existing.iter().filter(|s| s.is_paid()).map(|s| s.amount_cents).sum();
        validate_plan(&plan, booking.total_cents - paid_cents, config.allow_incomplete_bookings)?;

        let tokens: HashMap<String, String> = existing
            .iter()
            .filter(|s| !s.is_paid())
            .filter_map(|s| Some((s.identity()?, s.invite_token.clone()?)))
            .collect();
        let replacement = build_shares(booking_id, &plan, &tokens);
        let replaced = match self
            .retry
            .run("replace_unpaid_shares", || {
                self.shares.replace_unpaid_shares(booking_id, paid_cents, &replacement)
            })
            .await
        {
            Ok(replaced) => replaced,
            Err(StoreError::Conflict { constraint }) if constraint == "payment_shares_paid_changed" => {
                return Err(CoreError::InvalidState("a share was paid while the split was being edited".into()))
            }
            Err(err) => return Err(err.into()),
        };
        if !replaced {
            return Err(CoreError::InvalidState("booking was closed concurrently".into()));
        }

        info!(%booking_id, shares = replacement.len(), "split plan updated");
        let shares = self.shares.list_shares(booking_id).await?;
        Ok(share_views(&self.link_base, shares))
    }

    /// Expire bookings whose payment window lapsed. Partial payments are
    /// queued for refund. Sweeper only.
    pub async fn expire_lapsed(&self) -> CoreResult<Vec<Booking>> {
        let now = self.clock.utc();
        let expired = self.retry.run("expire_lapsed", || self.bookings.expire_lapsed(now)).await?;

        for booking in &expired {
            if let Err(err) = self.locks.release_for_booking(booking.id).await {
                error!(booking_id = %booking.id, error = %err, "failed to release holds of expired booking");
            }
            if booking.paid_cents > 0 {
                if let Err(err) = self.raise_refund(booking, SWEEPER_ACTOR).await {
                    error!(booking_id = %booking.id, error = %err, "failed to queue refund for expired booking");
                }
            }
            self.cache.invalidate(booking.key.owner_id, booking.key.date).await;
            self.events
                .publish(&SlotEvent::BookingExpired {
                    booking_id: booking.id,
                    owner_id: booking.key.owner_id,
                    paid_cents: booking.paid_cents,
                })
                .await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "lapsed bookings expired");
        }
        Ok(expired)
    }

    pub async fn refunds(&self, booking_id: Uuid) -> CoreResult<Vec<Refund>> {
        Ok(self.bookings.list_refunds(booking_id).await?)
    }

    async fn refund_terms(&self, owner_id: Uuid, actor: &str) -> CoreResult<RefundTerms> {
        let config = self.config.get_config(owner_id).await?;
        let now = self.clock.utc();
        Ok(RefundTerms {
            refund_id: Uuid::new_v4(),
            actor: actor.to_string(),
            expected_by: offset_by(now, Duration::try_days(config.refund_days), "refund_days")?,
            created_at: now,
        })
    }

    async fn raise_refund(&self, booking: &Booking, actor: &str) -> CoreResult<Option<Refund>> {
        let terms = self.refund_terms(booking.key.owner_id, actor).await?;
        let Some(refund) = terms.for_booking(booking) else {
            return Ok(None);
        };
        self.retry.run("insert_refund", || self.bookings.insert_refund(&refund)).await?;
        info!(booking_id = %booking.id, amount_cents = refund.amount_cents, "refund queued");
        Ok(Some(refund))
    }
}
