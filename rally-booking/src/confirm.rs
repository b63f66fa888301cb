use chrono::Duration;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rally_core::{
    Booking, BookingRepository, BookingStatus, ConfigProvider, Conflict, ConflictKind, CoreError,
    CoreResult, EventPublisher, PaymentShare, RetryPolicy, ShareRepository, SlotKey, SplitEntry,
    StoreError, TimeRange,
};
use rally_shared::SlotEvent;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::SlotCache;
use crate::idempotency::IdempotencyLedger;
use crate::locks::LockManager;
use crate::{offset_by, SharedClock};

const INVITE_TOKEN_LEN: usize = 32;

/// Largest booking total accepted, in cents.
pub const MAX_TOTAL_CENTS: i64 = 10_000_000_000;

#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub lock_id: Uuid,
    pub key: SlotKey,
    pub range: TimeRange,
    pub payer_id: String,
    pub payer_name: String,
    pub total_cents: i64,
    pub split_plan: Vec<SplitEntry>,
    pub idempotency_key: Option<String>,
    pub details: serde_json::Value,
}

/// A share as handed back to the initiator, with the link guests pay through.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ShareView {
    #[serde(flatten)]
    pub share: PaymentShare,
    pub payment_link: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Confirmation {
    pub booking: Booking,
    pub shares: Vec<ShareView>,
    pub idempotent_replay: bool,
}

/// Turns a hold into a booking, at most once per idempotency key.
pub struct BookingConfirmer {
    bookings: Arc<dyn BookingRepository>,
    shares: Arc<dyn ShareRepository>,
    config: Arc<dyn ConfigProvider>,
    locks: Arc<LockManager>,
    idempotency: Arc<IdempotencyLedger>,
    cache: Arc<SlotCache>,
    events: Arc<dyn EventPublisher>,
    clock: SharedClock,
    retry: RetryPolicy,
    link_base: String,
}

impl BookingConfirmer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        shares: Arc<dyn ShareRepository>,
        config: Arc<dyn ConfigProvider>,
        locks: Arc<LockManager>,
        idempotency: Arc<IdempotencyLedger>,
        cache: Arc<SlotCache>,
        events: Arc<dyn EventPublisher>,
        clock: SharedClock,
        retry: RetryPolicy,
        link_base: String,
    ) -> Self {
        Self { bookings, shares, config, locks, idempotency, cache, events, clock, retry, link_base }
    }

    pub async fn confirm(&self, request: ConfirmRequest) -> CoreResult<Confirmation> {
        validate_request(&request)?;

        let key = request.idempotency_key.as_deref();
        if let Some(replay) = self.replay(key).await? {
            return Ok(replay);
        }

        let now = self.clock.utc();
        let hold = self
            .locks
            .get(request.lock_id)
            .await?
            .filter(|h| h.booking_id.is_none())
            .ok_or(CoreError::LockNotFound(request.lock_id))?;
        if !hold.is_active_at(now) {
            return Err(CoreError::LockExpired(hold.id));
        }
        if hold.key != request.key || hold.range != request.range {
            return Err(CoreError::Validation("hold does not cover the requested slot".into()));
        }

        let config = self.config.get_config(request.key.owner_id).await?;
        let split = !request.split_plan.is_empty();
        if split {
            validate_plan(&request.split_plan, request.total_cents, config.allow_incomplete_bookings)?;
        }

        let booking_id = Uuid::new_v4();
        let (status, paid_cents, payment_deadline) = if split {
            let deadline = offset_by(
                now,
                Duration::try_minutes(config.split_payment_deadline_minutes),
                "split_payment_deadline_minutes",
            )?;
            (BookingStatus::PendingPayments, 0, Some(deadline))
        } else {
            (BookingStatus::Confirmed, request.total_cents, None)
        };
        let booking = Booking {
            id: booking_id,
            key: request.key,
            range: request.range,
            initiator_id: request.payer_id,
            initiator_name: request.payer_name,
            status,
            total_cents: request.total_cents,
            paid_cents,
            payment_deadline,
            details: request.details,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let shares = build_shares(booking_id, &request.split_plan, &HashMap::new());

        match self
            .retry
            .run("create_booking", || self.bookings.create_booking(&booking, &shares))
            .await
        {
            Ok(()) => {}
            Err(StoreError::Conflict { constraint }) if constraint.contains("no_overlap") => {
                // The winner may be a concurrent retry of this very request.
                if let Some(replay) = self.replay(key).await? {
                    return Ok(replay);
                }
                debug!(%constraint, "booking insert lost a race");
                return Err(CoreError::SlotTaken(Conflict::raced(ConflictKind::Booking)));
            }
            Err(err) => return Err(err.into()),
        }

        // The booking is durable from here on. A hold that cannot be converted
        // is left to expire on its own.
        match self.locks.convert_to_booking(hold.id, booking_id).await {
            Ok(_) => {
                if let Err(err) = self.locks.release(hold.id).await {
                    warn!(lock_id = %hold.id, error = %err, "failed to release converted hold");
                }
            }
            Err(err) => warn!(lock_id = %hold.id, %booking_id, error = %err, "failed to convert hold"),
        }

        self.idempotency.store(key, booking_id).await;
        self.cache.invalidate(booking.key.owner_id, booking.key.date).await;

        info!(%booking_id, status = %booking.status, shares = shares.len(), "booking confirmed");
        self.events
            .publish(&SlotEvent::BookingConfirmed {
                booking_id,
                owner_id: booking.key.owner_id,
                resource_id: booking.key.resource_id,
                date: booking.key.date,
                status: booking.status.to_string(),
                total_cents: booking.total_cents,
            })
            .await;

        Ok(Confirmation { booking, shares: share_views(&self.link_base, shares), idempotent_replay: false })
    }

    async fn replay(&self, key: Option<&str>) -> CoreResult<Option<Confirmation>> {
        let Some(booking_id) = self.idempotency.check(key).await? else {
            return Ok(None);
        };
        let Some(booking) = self.bookings.get_booking(booking_id).await? else {
            warn!(%booking_id, "idempotency record points at a missing booking");
            return Ok(None);
        };
        debug!(%booking_id, "idempotent replay of confirmation");
        let shares = self.shares.list_shares(booking_id).await?;
        Ok(Some(Confirmation { booking, shares: share_views(&self.link_base, shares), idempotent_replay: true }))
    }
}

fn validate_request(request: &ConfirmRequest) -> CoreResult<()> {
    if request.payer_id.trim().is_empty() {
        return Err(CoreError::Validation("payer is required".into()));
    }
    if !(0..=MAX_TOTAL_CENTS).contains(&request.total_cents) {
        return Err(CoreError::Validation(format!("total must be between 0 and {}", MAX_TOTAL_CENTS)));
    }
    Ok(())
}

/// A plan must cover `remaining_cents` exactly unless the club accepts
/// incomplete bookings, and may never exceed it.
pub(crate) fn validate_plan(plan: &[SplitEntry], remaining_cents: i64, allow_incomplete: bool) -> CoreResult<()> {
    if plan.iter().any(|entry| entry.amount_cents <= 0) {
        return Err(CoreError::Validation("split amounts must be positive".into()));
    }
    let mut seen = HashSet::new();
    for identity in plan.iter().filter_map(|e| e.payer.as_ref().map(|p| p.identity())) {
        if !seen.insert(identity) {
            return Err(CoreError::Validation("a payer appears twice in the split plan".into()));
        }
    }

    let planned = plan
        .iter()
        .try_fold(0i64, |sum, entry| sum.checked_add(entry.amount_cents))
        .ok_or_else(|| CoreError::Validation("split amounts are out of range".into()))?;
    if planned > remaining_cents {
        return Err(CoreError::Validation(format!(
            "split plan of {} exceeds the {} still owed",
            planned, remaining_cents
        )));
    }
    if !allow_incomplete && planned != remaining_cents {
        return Err(CoreError::Validation(format!(
            "split plan of {} must cover the {} owed",
            planned, remaining_cents
        )));
    }
    Ok(())
}

/// Shares for `plan`. Payers whose identity appears in `tokens` keep their
/// invite token; other guests get a fresh one.
pub(crate) fn build_shares(
    booking_id: Uuid,
    plan: &[SplitEntry],
    tokens: &HashMap<String, String>,
) -> Vec<PaymentShare> {
    plan.iter()
        .map(|entry| {
            let mut share = PaymentShare {
                id: Uuid::new_v4(),
                booking_id,
                payer: entry.payer.clone(),
                amount_cents: entry.amount_cents,
                paid_at: None,
                payment_reference: None,
                invite_token: None,
            };
            if share.needs_invite() {
                let kept = share.identity().and_then(|id| tokens.get(&id).cloned());
                share.invite_token = Some(kept.unwrap_or_else(mint_invite_token));
            }
            share
        })
        .collect()
}

fn mint_invite_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INVITE_TOKEN_LEN)
        .map(char::from)
        .collect()
}

pub(crate) fn share_views(link_base: &str, shares: Vec<PaymentShare>) -> Vec<ShareView> {
    shares
        .into_iter()
        .map(|share| {
            let payment_link = share.invite_token.as_ref().map(|token| format!("{}/pay/{}", link_base, token));
            ShareView { share, payment_link }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Stores;
    use crate::locks::HoldRequest;
    use crate::test_support::{key, range, Harness};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rally_core::{ClubConfig, IdempotencyRecord, IdempotencyRepository, PayerRef, StoreResult};
    use rally_shared::Masked;
    use rally_store::FailPoint;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Misses the first lookup, the way a request racing its own retry does.
    struct FirstLookupMisses {
        inner: Arc<dyn IdempotencyRepository>,
        missed: AtomicBool,
    }

    #[async_trait]
    impl IdempotencyRepository for FirstLookupMisses {
        async fn find(&self, key: &str, not_before: DateTime<Utc>) -> StoreResult<Option<IdempotencyRecord>> {
            if !self.missed.swap(true, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.find(key, not_before).await
        }

        async fn insert(&self, record: &IdempotencyRecord) -> StoreResult<()> {
            self.inner.insert(record).await
        }

        async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
            self.inner.purge_older_than(cutoff).await
        }
    }

    async fn held(h: &Harness) -> Uuid {
        h.engine
            .locks
            .acquire(HoldRequest { key: key(), range: range(18, 19), holder_id: "member-1".into(), hold_minutes: None })
            .await
            .unwrap()
            .id
    }

    fn request(lock_id: Uuid, total_cents: i64, split_plan: Vec<SplitEntry>) -> ConfirmRequest {
        ConfirmRequest {
            lock_id,
            key: key(),
            range: range(18, 19),
            payer_id: "member-1".into(),
            payer_name: "Ana".into(),
            total_cents,
            split_plan,
            idempotency_key: None,
            details: serde_json::json!({}),
        }
    }

    fn guest(contact: &str, amount_cents: i64) -> SplitEntry {
        SplitEntry {
            payer: Some(PayerRef::Guest { contact: Masked::new(contact.into()) }),
            amount_cents,
        }
    }

    #[tokio::test]
    async fn full_payment_confirms_and_consumes_the_hold() {
        let h = Harness::new();
        let lock_id = held(&h).await;
        let confirmation = h.engine.confirmer.confirm(request(lock_id, 10_000, vec![])).await.unwrap();

        assert_eq!(confirmation.booking.status, BookingStatus::Confirmed);
        assert_eq!(confirmation.booking.paid_cents, 10_000);
        assert_eq!(confirmation.booking.payment_deadline, None);
        assert!(confirmation.shares.is_empty());
        assert!(h.store.holds().await.is_empty());
    }

    #[tokio::test]
    async fn split_plan_sets_deadline_and_invite_links() {
        let h = Harness::new();
        let lock_id = held(&h).await;
        let plan = vec![
            SplitEntry { payer: Some(PayerRef::Registered { payer_id: "member-1".into() }), amount_cents: 4_000 },
            guest("bea@example.com", 6_000),
        ];
        let confirmation = h.engine.confirmer.confirm(request(lock_id, 10_000, plan)).await.unwrap();

        assert_eq!(confirmation.booking.status, BookingStatus::PendingPayments);
        assert_eq!(confirmation.booking.paid_cents, 0);
        assert_eq!(confirmation.booking.payment_deadline, Some(h.clock.now() + Duration::minutes(1440)));

        let member = &confirmation.shares[0];
        assert_eq!(member.share.invite_token, None);
        assert_eq!(member.payment_link, None);
        let guest = &confirmation.shares[1];
        let token = guest.share.invite_token.clone().unwrap();
        assert_eq!(token.len(), INVITE_TOKEN_LEN);
        assert_eq!(guest.payment_link, Some(format!("https://pay.test/pay/{}", token)));
    }

    #[tokio::test]
    async fn plan_must_cover_total_unless_club_allows_incomplete() {
        let h = Harness::new();
        let lock_id = held(&h).await;
        let short = vec![guest("a@example.com", 4_000)];
        let err = h.engine.confirmer.confirm(request(lock_id, 10_000, short.clone())).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        h.store
            .set_config(key().owner_id, ClubConfig { allow_incomplete_bookings: true, ..ClubConfig::default() })
            .await;
        let confirmation = h.engine.confirmer.confirm(request(lock_id, 10_000, short)).await.unwrap();
        assert_eq!(confirmation.shares.len(), 1);
    }

    #[tokio::test]
    async fn plan_exceeding_total_is_rejected() {
        let h = Harness::new();
        let lock_id = held(&h).await;
        let plan = vec![guest("a@example.com", 6_000), guest("b@example.com", 6_000)];
        let err = h.engine.confirmer.confirm(request(lock_id, 10_000, plan)).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(h.store.bookings().await.is_empty());
    }

    #[tokio::test]
    async fn overflowing_split_amounts_are_rejected() {
        let h = Harness::new();
        h.store
            .set_config(key().owner_id, ClubConfig { allow_incomplete_bookings: true, ..ClubConfig::default() })
            .await;
        let lock_id = held(&h).await;
        let plan = vec![guest("a@example.com", i64::MAX), guest("b@example.com", i64::MAX)];
        let err = h.engine.confirmer.confirm(request(lock_id, 10_000, plan)).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(h.store.bookings().await.is_empty());
        assert!(h.store.shares().await.is_empty());
    }

    #[tokio::test]
    async fn total_above_ceiling_is_rejected() {
        let h = Harness::new();
        let lock_id = held(&h).await;
        let err = h.engine.confirmer.confirm(request(lock_id, MAX_TOTAL_CENTS + 1, vec![])).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(h.store.holds().await[0].booking_id, None);
    }

    #[tokio::test]
    async fn losing_the_insert_to_an_own_retry_replays_it() {
        let h = Harness::with_stores(|stores| Stores {
            idempotency: Arc::new(FirstLookupMisses {
                inner: stores.idempotency.clone(),
                missed: AtomicBool::new(false),
            }),
            ..stores
        });
        let lock_id = held(&h).await;

        // The retry that got in first: booked and keyed, hold not yet converted.
        let now = h.clock.now();
        let winner = Booking {
            id: Uuid::new_v4(),
            key: key(),
            range: range(18, 19),
            initiator_id: "member-1".into(),
            initiator_name: "Ana".into(),
            status: BookingStatus::Confirmed,
            total_cents: 100,
            paid_cents: 100,
            payment_deadline: None,
            details: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        h.store.create_booking(&winner, &[]).await.unwrap();
        h.store
            .insert(&IdempotencyRecord { key: "retry-1".into(), booking_id: winner.id, created_at: now })
            .await
            .unwrap();

        let mut req = request(lock_id, 100, vec![]);
        req.idempotency_key = Some("retry-1".into());
        let confirmation = h.engine.confirmer.confirm(req).await.unwrap();
        assert!(confirmation.idempotent_replay);
        assert_eq!(confirmation.booking.id, winner.id);
        assert_eq!(h.store.bookings().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_consumed_and_expired_holds_are_client_errors() {
        let h = Harness::new();
        let unknown = Uuid::new_v4();
        assert!(matches!(
            h.engine.confirmer.confirm(request(unknown, 100, vec![])).await,
            Err(CoreError::LockNotFound(id)) if id == unknown
        ));

        let lock_id = held(&h).await;
        h.clock.advance(Duration::minutes(11));
        assert!(matches!(
            h.engine.confirmer.confirm(request(lock_id, 100, vec![])).await,
            Err(CoreError::LockExpired(_))
        ));
    }

    #[tokio::test]
    async fn hold_for_another_range_is_rejected() {
        let h = Harness::new();
        let lock_id = held(&h).await;
        let mut req = request(lock_id, 100, vec![]);
        req.range = range(19, 20);
        assert!(matches!(h.engine.confirmer.confirm(req).await, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn failure_before_conversion_leaves_hold_active() {
        let h = Harness::new();
        let lock_id = held(&h).await;
        h.store.fail_next(FailPoint::CreateBooking, StoreError::Permanent("connection reset".into())).await;

        let err = h.engine.confirmer.confirm(request(lock_id, 100, vec![])).await.unwrap_err();
        assert!(matches!(err, CoreError::Store(_)));

        let holds = h.store.holds().await;
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].booking_id, None);
        assert!(h.store.bookings().await.is_empty());

        // A retry with the same hold goes through.
        assert!(h.engine.confirmer.confirm(request(lock_id, 100, vec![])).await.is_ok());
    }

    #[tokio::test]
    async fn conversion_failure_does_not_undo_the_booking() {
        let h = Harness::new();
        let lock_id = held(&h).await;
        h.store.fail_next(FailPoint::MarkConverted, StoreError::Permanent("connection reset".into())).await;

        let confirmation = h.engine.confirmer.confirm(request(lock_id, 100, vec![])).await.unwrap();
        assert_eq!(confirmation.booking.status, BookingStatus::Confirmed);
        assert_eq!(h.store.holds().await.len(), 1);
    }

    #[test]
    fn plan_sum_overflow_is_a_validation_error() {
        let plan = vec![SplitEntry { payer: None, amount_cents: i64::MAX }, SplitEntry { payer: None, amount_cents: 1 }];
        assert!(matches!(validate_plan(&plan, 100, true), Err(CoreError::Validation(_))));
    }

    #[test]
    fn duplicate_payers_are_rejected() {
        let plan = vec![guest("A@example.com", 50), guest("a@example.com ", 50)];
        assert!(validate_plan(&plan, 100, false).is_err());
    }

    #[test]
    fn kept_tokens_follow_payer_identity() {
        let entry = guest("a@example.com", 50);
        let identity = entry.payer.as_ref().unwrap().identity();
        let tokens = HashMap::from([(identity, "kept-token".to_string())]);
        let shares = build_shares(Uuid::new_v4(), &[entry, SplitEntry { payer: None, amount_cents: 50 }], &tokens);
        assert_eq!(shares[0].invite_token.as_deref(), Some("kept-token"));
        assert!(shares[1].invite_token.is_some());
        assert_ne!(shares[1].invite_token.as_deref(), Some("kept-token"));
    }
}
