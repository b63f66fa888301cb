use chrono::NaiveDate;
use rally_core::{
    BookingRepository, ConfigProvider, CoreResult, EngineSettings, EventPublisher, HoldRepository,
    IdempotencyRepository, ShareRepository,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::{SlotCache, SlotGrid};
use crate::confirm::BookingConfirmer;
use crate::conflict::ConflictDetector;
use crate::idempotency::IdempotencyLedger;
use crate::ledger::PaymentLedger;
use crate::lifecycle::BookingLifecycle;
use crate::locks::LockManager;
use crate::sweeper::ExpirationSweeper;
use crate::SharedClock;

/// Handles to the persistence ports.
#[derive(Clone)]
pub struct Stores {
    pub holds: Arc<dyn HoldRepository>,
    pub bookings: Arc<dyn BookingRepository>,
    pub shares: Arc<dyn ShareRepository>,
    pub idempotency: Arc<dyn IdempotencyRepository>,
    pub config: Arc<dyn ConfigProvider>,
}

impl Stores {
    /// Every port served by one backend.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: HoldRepository
            + BookingRepository
            + ShareRepository
            + IdempotencyRepository
            + ConfigProvider
            + 'static,
    {
        Self {
            holds: store.clone(),
            bookings: store.clone(),
            shares: store.clone(),
            idempotency: store.clone(),
            config: store,
        }
    }
}

/// The wired reservation engine. One per process; cheap to share behind an
/// `Arc`.
pub struct SlotEngine {
    pub detector: Arc<ConflictDetector>,
    pub locks: Arc<LockManager>,
    pub idempotency: Arc<IdempotencyLedger>,
    pub confirmer: Arc<BookingConfirmer>,
    pub payments: Arc<PaymentLedger>,
    pub lifecycle: Arc<BookingLifecycle>,
    pub sweeper: Arc<ExpirationSweeper>,
    pub cache: Arc<SlotCache>,
    stores: Stores,
    clock: SharedClock,
}

impl SlotEngine {
    pub fn new(
        stores: Stores,
        events: Arc<dyn EventPublisher>,
        clock: SharedClock,
        settings: &EngineSettings,
    ) -> Self {
        let cache = Arc::new(SlotCache::new(settings.cache_ttl, clock.clone()));
        let detector = Arc::new(ConflictDetector::new(
            stores.holds.clone(),
            stores.bookings.clone(),
            clock.clone(),
        ));
        let locks = Arc::new(LockManager::new(
            stores.holds.clone(),
            stores.config.clone(),
            detector.clone(),
            cache.clone(),
            events.clone(),
            clock.clone(),
            settings.retry.clone(),
        ));
        let idempotency = Arc::new(IdempotencyLedger::new(
            stores.idempotency.clone(),
            clock.clone(),
            settings.idempotency_retention,
        ));
        let confirmer = Arc::new(BookingConfirmer::new(
            stores.bookings.clone(),
            stores.shares.clone(),
            stores.config.clone(),
            locks.clone(),
            idempotency.clone(),
            cache.clone(),
            events.clone(),
            clock.clone(),
            settings.retry.clone(),
            settings.payment_link_base.clone(),
        ));
        let payments = Arc::new(PaymentLedger::new(
            stores.shares.clone(),
            stores.bookings.clone(),
            cache.clone(),
            events.clone(),
            clock.clone(),
            settings.retry.clone(),
        ));
        let lifecycle = Arc::new(BookingLifecycle::new(
            stores.bookings.clone(),
            stores.shares.clone(),
            stores.config.clone(),
            detector.clone(),
            locks.clone(),
            cache.clone(),
            events,
            clock.clone(),
            settings.retry.clone(),
            settings.payment_link_base.clone(),
        ));
        let sweeper = Arc::new(ExpirationSweeper::new(
            locks.clone(),
            lifecycle.clone(),
            idempotency.clone(),
        ));

        Self { detector, locks, idempotency, confirmer, payments, lifecycle, sweeper, cache, stores, clock }
    }

    /// Live holds and occupying bookings of a club's day, read through the
    /// slot cache.
    pub async fn grid(&self, owner_id: Uuid, date: NaiveDate) -> CoreResult<SlotGrid> {
        if let Some(grid) = self.cache.get(owner_id, date).await {
            return Ok(grid);
        }
        let holds = self.stores.holds.list_active(owner_id, date, self.clock.utc()).await?;
        let bookings = self.stores.bookings.list_active(owner_id, date).await?;
        let grid = SlotGrid { holds, bookings };
        self.cache.set(owner_id, date, grid.clone()).await;
        Ok(grid)
    }
}
