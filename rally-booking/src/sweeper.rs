use serde::Serialize;
use std::sync::Arc;
use tracing::error;

use crate::idempotency::IdempotencyLedger;
use crate::lifecycle::BookingLifecycle;
use crate::locks::LockManager;

/// Outcome of one sweep. `None` marks an action that failed this tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub holds_expired: Option<usize>,
    pub bookings_expired: Option<usize>,
    pub idempotency_purged: Option<u64>,
}

/// Housekeeping on a timer: reclaims abandoned holds, expires bookings whose
/// payment window lapsed and drops stale idempotency records. The actions are
/// independent; one failing does not stop the others.
pub struct ExpirationSweeper {
    locks: Arc<LockManager>,
    lifecycle: Arc<BookingLifecycle>,
    idempotency: Arc<IdempotencyLedger>,
}

impl ExpirationSweeper {
    pub fn new(
        locks: Arc<LockManager>,
        lifecycle: Arc<BookingLifecycle>,
        idempotency: Arc<IdempotencyLedger>,
    ) -> Self {
        Self { locks, lifecycle, idempotency }
    }

    pub async fn run_once(&self) -> SweepReport {
        let holds_expired = match self.locks.expire_stale().await {
            Ok(count) => Some(count),
            Err(err) => {
                error!(error = %err, "hold sweep failed");
                None
            }
        };

        let bookings_expired = match self.lifecycle.expire_lapsed().await {
            Ok(expired) => Some(expired.len()),
            Err(err) => {
                error!(error = %err, "booking expiry sweep failed");
                None
            }
        };

        let idempotency_purged = match self.idempotency.purge_expired().await {
            Ok(count) => Some(count),
            Err(err) => {
                error!(error = %err, "idempotency purge failed");
                None
            }
        };

        SweepReport { holds_expired, bookings_expired, idempotency_purged }
    }
}

#[cfg(test)]
mod tests {
    use crate::locks::HoldRequest;
    use crate::test_support::{key, range, Harness};
    use chrono::Duration;
    use rally_core::StoreError;
    use rally_store::FailPoint;

    fn short_hold(holder: &str) -> HoldRequest {
        HoldRequest { key: key(), range: range(18, 19), holder_id: holder.into(), hold_minutes: Some(1) }
    }

    #[tokio::test]
    async fn one_failing_action_does_not_stop_the_other() {
        let h = Harness::new();
        h.engine.locks.acquire(short_hold("member-1")).await.unwrap();
        h.clock.advance(Duration::minutes(2));

        h.store.fail_next(FailPoint::ExpireBookings, StoreError::Permanent("relation missing".into())).await;
        let report = h.engine.sweeper.run_once().await;
        assert_eq!(report.holds_expired, Some(1));
        assert_eq!(report.bookings_expired, None);
        assert_eq!(report.idempotency_purged, Some(0));

        h.engine.locks.acquire(short_hold("member-2")).await.unwrap();
        h.clock.advance(Duration::minutes(2));
        h.store.fail_next(FailPoint::ExpireHolds, StoreError::Permanent("relation missing".into())).await;
        let report = h.engine.sweeper.run_once().await;
        assert_eq!(report.holds_expired, None);
        assert_eq!(report.bookings_expired, Some(0));
    }

    #[tokio::test]
    async fn sweep_invalidates_the_grid() {
        let h = Harness::new();
        let day = key().date;
        h.engine.locks.acquire(short_hold("member-1")).await.unwrap();
        h.engine.grid(key().owner_id, day).await.unwrap();
        h.clock.advance(Duration::minutes(2));

        h.engine.sweeper.run_once().await;
        let grid = h.engine.grid(key().owner_id, day).await.unwrap();
        assert!(grid.holds.is_empty());
    }
}
