use rally_core::{BookingRepository, Conflict, CoreResult, HoldRepository, SlotKey, TimeRange};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::SharedClock;

/// Decides whether a range is free on a court, before any hold is created or
/// any booking moved. Always reads the store, never the slot cache.
pub struct ConflictDetector {
    holds: Arc<dyn HoldRepository>,
    bookings: Arc<dyn BookingRepository>,
    clock: SharedClock,
}

impl ConflictDetector {
    pub fn new(
        holds: Arc<dyn HoldRepository>,
        bookings: Arc<dyn BookingRepository>,
        clock: SharedClock,
    ) -> Self {
        Self { holds, bookings, clock }
    }

    /// First live hold, then first occupying booking, overlapping `range`.
    /// `exclude_booking` lets a booking be moved over its own range.
    pub async fn has_conflict(
        &self,
        key: &SlotKey,
        range: &TimeRange,
        exclude_booking: Option<Uuid>,
    ) -> CoreResult<Option<Conflict>> {
        let now = self.clock.utc();
        let holds = self.holds.find_active_overlapping(key, range, now).await?;
        if let Some(hold) = holds.first() {
            debug!(lock_id = %hold.id, "range overlaps a live hold");
            return Ok(Some(Conflict::with_hold(hold)));
        }

        let bookings = self.bookings.find_active_overlapping(key, range, exclude_booking).await?;
        if let Some(booking) = bookings.first() {
            debug!(booking_id = %booking.id, "range overlaps a booking");
            return Ok(Some(Conflict::with_booking(booking)));
        }

        Ok(None)
    }
}
