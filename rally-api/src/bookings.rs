use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rally_booking::{ConfirmRequest, ShareView};
use rally_core::{Booking, BookingStatus, Refund, SlotKey, SplitEntry, TimeRange};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
struct ConfirmBookingRequest {
    lock_id: Uuid,
    owner_id: Uuid,
    resource_id: Uuid,
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
    payer_id: String,
    payer_name: String,
    total_cents: i64,
    #[serde(default)]
    split_plan: Vec<SplitEntry>,
    idempotency_key: Option<String>,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ConfirmBookingResponse {
    booking_id: Uuid,
    status: BookingStatus,
    paid_cents: i64,
    payment_deadline: Option<DateTime<Utc>>,
    idempotent_replay: bool,
    shares: Vec<ShareView>,
}

#[derive(Debug, Serialize)]
struct BookingResponse {
    booking: Booking,
    shares: Vec<ShareView>,
}

#[derive(Debug, Deserialize)]
struct CancelBookingRequest {
    actor: String,
}

#[derive(Debug, Serialize)]
struct CancelBookingResponse {
    #[serde(rename = "type")]
    kind: &'static str,
    booking_id: Uuid,
    status: BookingStatus,
    refund: Option<Refund>,
}

#[derive(Debug, Deserialize)]
struct RescheduleRequest {
    start: NaiveTime,
    end: NaiveTime,
}

#[derive(Debug, Deserialize)]
struct SplitPlanRequest {
    split_plan: Vec<SplitEntry>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/bookings", post(confirm_booking))
        .route("/v1/bookings/{booking_id}", get(get_booking))
        .route("/v1/bookings/{booking_id}/cancel", post(cancel_booking))
        .route("/v1/bookings/{booking_id}/reschedule", post(reschedule_booking))
        .route("/v1/bookings/{booking_id}/split", put(update_split))
}

async fn confirm_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ConfirmBookingRequest>,
) -> Result<(StatusCode, Json<ConfirmBookingResponse>), AppError> {
    let range = TimeRange::new(req.start, req.end)?;
    // Body field wins over the header.
    let idempotency_key = req.idempotency_key.or_else(|| {
        headers
            .get(IDEMPOTENCY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    let confirmation = state
        .engine
        .confirmer
        .confirm(ConfirmRequest {
            lock_id: req.lock_id,
            key: SlotKey { owner_id: req.owner_id, resource_id: req.resource_id, date: req.date },
            range,
            payer_id: req.payer_id,
            payer_name: req.payer_name,
            total_cents: req.total_cents,
            split_plan: req.split_plan,
            idempotency_key,
            details: req.details.unwrap_or_else(|| serde_json::json!({})),
        })
        .await?;

    let status = if confirmation.idempotent_replay { StatusCode::OK } else { StatusCode::CREATED };
    Ok((
        status,
        Json(ConfirmBookingResponse {
            booking_id: confirmation.booking.id,
            status: confirmation.booking.status,
            paid_cents: confirmation.booking.paid_cents,
            payment_deadline: confirmation.booking.payment_deadline,
            idempotent_replay: confirmation.idempotent_replay,
            shares: confirmation.shares,
        }),
    ))
}

async fn get_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<BookingResponse>, AppError> {
    let (booking, shares) = state.engine.lifecycle.get(booking_id).await?;
    Ok(Json(BookingResponse { booking, shares }))
}

async fn cancel_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(req): Json<CancelBookingRequest>,
) -> Result<Json<CancelBookingResponse>, AppError> {
    if req.actor.trim().is_empty() {
        return Err(AppError::BadRequest("actor is required".into()));
    }
    let cancellation = state.engine.lifecycle.cancel(booking_id, &req.actor).await?;
    Ok(Json(CancelBookingResponse {
        kind: "booking",
        booking_id,
        status: cancellation.booking.status,
        refund: cancellation.refund,
    }))
}

async fn reschedule_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(req): Json<RescheduleRequest>,
) -> Result<Json<Booking>, AppError> {
    let range = TimeRange::new(req.start, req.end)?;
    Ok(Json(state.engine.lifecycle.reschedule(booking_id, range).await?))
}

async fn update_split(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(req): Json<SplitPlanRequest>,
) -> Result<Json<Vec<ShareView>>, AppError> {
    Ok(Json(state.engine.lifecycle.update_split_plan(booking_id, req.split_plan).await?))
}
