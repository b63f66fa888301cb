use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain events emitted by the reservation engine for downstream consumers
/// (notifications, analytics, club dashboards).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotEvent {
    HoldAcquired {
        lock_id: Uuid,
        owner_id: Uuid,
        resource_id: Uuid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        expires_at: i64,
    },
    HoldReleased {
        lock_id: Uuid,
        owner_id: Uuid,
        date: NaiveDate,
    },
    BookingConfirmed {
        booking_id: Uuid,
        owner_id: Uuid,
        resource_id: Uuid,
        date: NaiveDate,
        status: String,
        total_cents: i64,
    },
    BookingRescheduled {
        booking_id: Uuid,
        owner_id: Uuid,
        start: NaiveTime,
        end: NaiveTime,
    },
    BookingCancelled {
        booking_id: Uuid,
        owner_id: Uuid,
        refund_cents: i64,
        actor: String,
    },
    BookingExpired {
        booking_id: Uuid,
        owner_id: Uuid,
        paid_cents: i64,
    },
    PaymentRecorded {
        booking_id: Uuid,
        share_id: Uuid,
        paid_cents: i64,
        status: String,
    },
}

impl SlotEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            SlotEvent::HoldAcquired { .. } => "holds.acquired",
            SlotEvent::HoldReleased { .. } => "holds.released",
            SlotEvent::BookingConfirmed { .. } => "bookings.confirmed",
            SlotEvent::BookingRescheduled { .. } => "bookings.rescheduled",
            SlotEvent::BookingCancelled { .. } => "bookings.cancelled",
            SlotEvent::BookingExpired { .. } => "bookings.expired",
            SlotEvent::PaymentRecorded { .. } => "payments.recorded",
        }
    }

    /// Partition key; everything about one club lands on the same partition so
    /// consumers see a club's events in order.
    pub fn key(&self) -> String {
        match self {
            SlotEvent::HoldAcquired { owner_id, .. }
            | SlotEvent::HoldReleased { owner_id, .. }
            | SlotEvent::BookingConfirmed { owner_id, .. }
            | SlotEvent::BookingRescheduled { owner_id, .. }
            | SlotEvent::BookingCancelled { owner_id, .. }
            | SlotEvent::BookingExpired { owner_id, .. } => owner_id.to_string(),
            SlotEvent::PaymentRecorded { booking_id, .. } => booking_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_by_type() {
        let event = SlotEvent::BookingExpired {
            booking_id: Uuid::nil(),
            owner_id: Uuid::nil(),
            paid_cents: 4000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "booking_expired");
        assert_eq!(event.topic(), "bookings.expired");
        assert_eq!(event.key(), Uuid::nil().to_string());
    }
}
