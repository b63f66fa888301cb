use rally_core::{CoreResult, IdempotencyRecord, IdempotencyRepository, StoreError};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::SharedClock;

/// Maps client idempotency keys to the booking they produced.
pub struct IdempotencyLedger {
    repo: Arc<dyn IdempotencyRepository>,
    clock: SharedClock,
    retention: chrono::Duration,
}

fn requested(key: Option<&str>) -> Option<&str> {
    key.map(str::trim).filter(|k| !k.is_empty())
}

impl IdempotencyLedger {
    pub fn new(repo: Arc<dyn IdempotencyRepository>, clock: SharedClock, retention: chrono::Duration) -> Self {
        Self { repo, clock, retention }
    }

    /// Booking recorded for `key` within the retention window. A blank key
    /// never matches.
    pub async fn check(&self, key: Option<&str>) -> CoreResult<Option<Uuid>> {
        let Some(key) = requested(key) else {
            return Ok(None);
        };
        let not_before = self.clock.utc() - self.retention;
        Ok(self.repo.find(key, not_before).await?.map(|r| r.booking_id))
    }

    /// Best effort. A duplicate key means a concurrent request got there
    /// first; any other failure is logged and dropped.
    pub async fn store(&self, key: Option<&str>, booking_id: Uuid) {
        let Some(key) = requested(key) else {
            return;
        };
        let record = IdempotencyRecord { key: key.to_string(), booking_id, created_at: self.clock.utc() };
        match self.repo.insert(&record).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                debug!(%booking_id, "idempotency key already recorded");
            }
            Err(err) => {
                warn!(%booking_id, error = %err, "failed to record idempotency key");
            }
        }
    }

    /// Drop records past retention. Returns how many went.
    pub async fn purge_expired(&self) -> CoreResult<u64> {
        let cutoff = self.clock.utc() - self.retention;
        Ok(self.repo.purge_older_than(cutoff).await?)
    }
}
