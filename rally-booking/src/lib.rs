//! Reservation engine for time-sliced courts: holds, booking confirmation,
//! split payments, cancellation and the expiry sweep.

pub mod cache;
pub mod confirm;
pub mod conflict;
pub mod engine;
pub mod idempotency;
pub mod ledger;
pub mod lifecycle;
pub mod locks;
pub mod sweeper;

pub use cache::{SlotCache, SlotGrid};
pub use confirm::{BookingConfirmer, ConfirmRequest, Confirmation, ShareView};
pub use conflict::ConflictDetector;
pub use engine::{SlotEngine, Stores};
pub use idempotency::IdempotencyLedger;
pub use ledger::{Invite, PaymentLedger, PaymentOutcome, PublicBooking, ShareLocator};
pub use lifecycle::{BookingLifecycle, Cancellation, SWEEPER_ACTOR};
pub use locks::{HoldRequest, LockManager};
pub use sweeper::{ExpirationSweeper, SweepReport};

use chrono::{DateTime, Utc};
use mockable::Clock;
use rally_core::{CoreError, CoreResult};
use std::sync::Arc;

/// Time source shared by every engine component.
pub type SharedClock = Arc<dyn Clock + Send + Sync>;

/// `from` moved by `delta`. `delta` is `None` when building the duration
/// already overflowed; either overflow is a validation error naming `what`.
pub(crate) fn offset_by(
    from: DateTime<Utc>,
    delta: Option<chrono::Duration>,
    what: &str,
) -> CoreResult<DateTime<Utc>> {
    delta
        .and_then(|delta| from.checked_add_signed(delta))
        .ok_or_else(|| CoreError::Validation(format!("{} is out of range", what)))
}
