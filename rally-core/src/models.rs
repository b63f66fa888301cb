use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rally_shared::Masked;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Payments within one cent of the total count as settled in full.
pub const PAYMENT_TOLERANCE_CENTS: i64 = 1;

/// The exclusivity scope: one court of one club on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub owner_id: Uuid,
    pub resource_id: Uuid,
    pub date: NaiveDate,
}

/// Half-open `[start, end)` range within a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, crate::CoreError> {
        if start >= end {
            return Err(crate::CoreError::Validation(format!(
                "start {} must be before end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && self.end > other.start
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hold {
    pub id: Uuid,
    pub key: SlotKey,
    pub range: TimeRange,
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
    pub booking_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Hold {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Initiated,
    Locked,
    PendingPayments,
    PartiallyPaid,
    Confirmed,
    Cancelled,
    Expired,
}

impl BookingStatus {
    /// Statuses that occupy their time range exclusively.
    pub const OCCUPYING: [BookingStatus; 5] = [
        BookingStatus::Initiated,
        BookingStatus::Locked,
        BookingStatus::PendingPayments,
        BookingStatus::PartiallyPaid,
        BookingStatus::Confirmed,
    ];

    /// Statuses the sweeper moves to `Expired` once the payment deadline lapses.
    pub const EXPIRABLE: [BookingStatus; 4] = [
        BookingStatus::Initiated,
        BookingStatus::Locked,
        BookingStatus::PendingPayments,
        BookingStatus::PartiallyPaid,
    ];

    pub fn is_occupying(&self) -> bool {
        Self::OCCUPYING.contains(self)
    }

    pub fn is_expirable(&self) -> bool {
        Self::EXPIRABLE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Expired)
    }

    /// Status implied by the amount settled so far.
    pub fn from_payment(paid_cents: i64, total_cents: i64) -> Self {
        if paid_cents + PAYMENT_TOLERANCE_CENTS >= total_cents {
            BookingStatus::Confirmed
        } else if paid_cents > 0 {
            BookingStatus::PartiallyPaid
        } else {
            BookingStatus::PendingPayments
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Initiated => "initiated",
            BookingStatus::Locked => "locked",
            BookingStatus::PendingPayments => "pending_payments",
            BookingStatus::PartiallyPaid => "partially_paid",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(BookingStatus::Initiated),
            "locked" => Ok(BookingStatus::Locked),
            "pending_payments" => Ok(BookingStatus::PendingPayments),
            "partially_paid" => Ok(BookingStatus::PartiallyPaid),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "expired" => Ok(BookingStatus::Expired),
            other => Err(format!("unknown booking status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Booking {
    pub id: Uuid,
    pub key: SlotKey,
    pub range: TimeRange,
    pub initiator_id: String,
    pub initiator_name: String,
    pub status: BookingStatus,
    pub total_cents: i64,
    pub paid_cents: i64,
    pub payment_deadline: Option<DateTime<Utc>>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker, set on cancellation.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Who owes a share: a platform member, or someone reachable only by contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayerRef {
    Registered { payer_id: String },
    Guest { contact: Masked<String> },
}

impl PayerRef {
    /// Stable identity of a payer within one booking.
    pub fn identity(&self) -> String {
        match self {
            PayerRef::Registered { payer_id } => format!("payer:{}", payer_id),
            PayerRef::Guest { contact } => {
                format!("contact:{}", contact.expose().trim().to_lowercase())
            }
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, PayerRef::Registered { .. })
    }
}

/// One line of a split plan supplied at confirmation time. A missing payer is
/// an anonymous guest that will be reached through the invite link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitEntry {
    #[serde(default)]
    pub payer: Option<PayerRef>,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentShare {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub payer: Option<PayerRef>,
    pub amount_cents: i64,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_reference: Option<String>,
    pub invite_token: Option<String>,
}

impl PaymentShare {
    pub fn is_paid(&self) -> bool {
        self.paid_at.is_some()
    }

    pub fn identity(&self) -> Option<String> {
        self.payer.as_ref().map(PayerRef::identity)
    }

    /// Registered payers settle from their account; everyone else needs a link.
    pub fn needs_invite(&self) -> bool {
        !self.payer.as_ref().is_some_and(PayerRef::is_registered)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub booking_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Refund {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub amount_cents: i64,
    pub expected_by: DateTime<Utc>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// A refund to raise alongside a state change. The amount is whatever the
/// booking turns out to have been paid when the change commits.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundTerms {
    pub refund_id: Uuid,
    pub actor: String,
    pub expected_by: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RefundTerms {
    /// `None` when nothing was paid.
    pub fn for_booking(&self, booking: &Booking) -> Option<Refund> {
        (booking.paid_cents > 0).then(|| Refund {
            id: self.refund_id,
            booking_id: booking.id,
            amount_cents: booking.paid_cents,
            expected_by: self.expected_by,
            actor: self.actor.clone(),
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Lock,
    Booking,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::Lock => f.write_str("lock"),
            ConflictKind::Booking => f.write_str("booking"),
        }
    }
}

/// The entity standing in the way of a hold or reschedule. `id` is absent when
/// the conflict surfaced only as a store constraint rejection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conflict {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub id: Option<Uuid>,
    pub range: Option<TimeRange>,
}

impl Conflict {
    pub fn with_hold(hold: &Hold) -> Self {
        Self { kind: ConflictKind::Lock, id: Some(hold.id), range: Some(hold.range) }
    }

    pub fn with_booking(booking: &Booking) -> Self {
        Self { kind: ConflictKind::Booking, id: Some(booking.id), range: Some(booking.range) }
    }

    pub fn raced(kind: ConflictKind) -> Self {
        Self { kind, id: None, range: None }
    }
}
