use chrono::Duration;
use rally_core::{
    ConfigProvider, Conflict, ConflictKind, CoreError, CoreResult, EventPublisher, Hold,
    HoldRepository, RetryPolicy, SlotKey, StoreError, TimeRange,
};
use rally_shared::SlotEvent;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::SlotCache;
use crate::conflict::ConflictDetector;
use crate::{offset_by, SharedClock};

/// Longest hold a caller may ask for.
pub const MAX_HOLD_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub key: SlotKey,
    pub range: TimeRange,
    pub holder_id: String,
    /// Overrides the club's configured hold duration.
    pub hold_minutes: Option<i64>,
}

/// Short-lived exclusive holds on a court range.
pub struct LockManager {
    holds: Arc<dyn HoldRepository>,
    config: Arc<dyn ConfigProvider>,
    detector: Arc<ConflictDetector>,
    cache: Arc<SlotCache>,
    events: Arc<dyn EventPublisher>,
    clock: SharedClock,
    retry: RetryPolicy,
}

impl LockManager {
    pub fn new(
        holds: Arc<dyn HoldRepository>,
        config: Arc<dyn ConfigProvider>,
        detector: Arc<ConflictDetector>,
        cache: Arc<SlotCache>,
        events: Arc<dyn EventPublisher>,
        clock: SharedClock,
        retry: RetryPolicy,
    ) -> Self {
        Self { holds, config, detector, cache, events, clock, retry }
    }

    /// Check, then insert. A constraint rejection of the insert means another
    /// request won the same range in between and is reported like a
    /// pre-detected conflict.
    pub async fn acquire(&self, request: HoldRequest) -> CoreResult<Hold> {
        if request.holder_id.trim().is_empty() {
            return Err(CoreError::Validation("holder is required".into()));
        }
        let hold_minutes = match request.hold_minutes {
            Some(minutes) if minutes <= 0 || minutes > MAX_HOLD_MINUTES => {
                return Err(CoreError::Validation(format!(
                    "hold_minutes must be between 1 and {}",
                    MAX_HOLD_MINUTES
                )))
            }
            Some(minutes) => minutes,
            None => self.config.get_config(request.key.owner_id).await?.hold_minutes,
        };

        if let Some(conflict) = self.detector.has_conflict(&request.key, &request.range, None).await? {
            debug!(owner_id = %request.key.owner_id, kind = %conflict.kind, "slot taken");
            return Err(CoreError::SlotTaken(conflict));
        }

        let now = self.clock.utc();
        let expires_at = offset_by(now, Duration::try_minutes(hold_minutes), "hold_minutes")?;
        let hold = Hold {
            id: Uuid::new_v4(),
            key: request.key,
            range: request.range,
            holder_id: request.holder_id,
            expires_at,
            booking_id: None,
            created_at: now,
        };

        match self.retry.run("insert_hold", || self.holds.insert_hold(&hold)).await {
            Ok(()) => {}
            Err(StoreError::Conflict { constraint }) => {
                debug!(%constraint, "hold insert lost a race");
                return Err(CoreError::SlotTaken(Conflict::raced(ConflictKind::Lock)));
            }
            Err(err) => return Err(err.into()),
        }

        self.cache.invalidate(hold.key.owner_id, hold.key.date).await;
        info!(lock_id = %hold.id, resource_id = %hold.key.resource_id, date = %hold.key.date, "hold acquired");
        self.events
            .publish(&SlotEvent::HoldAcquired {
                lock_id: hold.id,
                owner_id: hold.key.owner_id,
                resource_id: hold.key.resource_id,
                date: hold.key.date,
                start: hold.range.start,
                end: hold.range.end,
                expires_at: hold.expires_at.timestamp(),
            })
            .await;

        Ok(hold)
    }

    /// Idempotent; `false` when there was nothing to release.
    pub async fn release(&self, lock_id: Uuid) -> CoreResult<bool> {
        let removed = self.retry.run("delete_hold", || self.holds.delete_hold(lock_id)).await?;
        let Some(hold) = removed else {
            return Ok(false);
        };

        self.cache.invalidate(hold.key.owner_id, hold.key.date).await;
        info!(lock_id = %hold.id, "hold released");
        self.events
            .publish(&SlotEvent::HoldReleased {
                lock_id: hold.id,
                owner_id: hold.key.owner_id,
                date: hold.key.date,
            })
            .await;
        Ok(true)
    }

    pub async fn get(&self, lock_id: Uuid) -> CoreResult<Option<Hold>> {
        Ok(self.holds.get_hold(lock_id).await?)
    }

    /// Stamp the hold with the booking it produced.
    pub async fn convert_to_booking(&self, lock_id: Uuid, booking_id: Uuid) -> CoreResult<bool> {
        Ok(self
            .retry
            .run("mark_converted", || self.holds.mark_converted(lock_id, booking_id))
            .await?)
    }

    /// Release every hold still pointing at `booking_id`.
    pub async fn release_for_booking(&self, booking_id: Uuid) -> CoreResult<usize> {
        let removed = self
            .retry
            .run("delete_for_booking", || self.holds.delete_for_booking(booking_id))
            .await?;
        self.invalidate_all(&removed).await;
        Ok(removed.len())
    }

    /// Delete holds past their expiry. Sweeper only.
    pub async fn expire_stale(&self) -> CoreResult<usize> {
        let now = self.clock.utc();
        let removed = self.retry.run("delete_expired", || self.holds.delete_expired(now)).await?;
        self.invalidate_all(&removed).await;
        if !removed.is_empty() {
            info!(count = removed.len(), "expired holds reclaimed");
        }
        Ok(removed.len())
    }

    async fn invalidate_all(&self, holds: &[Hold]) {
        let days: HashSet<_> = holds.iter().map(|h| (h.key.owner_id, h.key.date)).collect();
        for (owner_id, date) in days {
            self.cache.invalidate(owner_id, date).await;
        }
    }
}
