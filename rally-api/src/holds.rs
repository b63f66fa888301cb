use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rally_booking::{HoldRequest, SlotGrid};
use rally_core::{SlotKey, TimeRange};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct AcquireHoldRequest {
    owner_id: Uuid,
    resource_id: Uuid,
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
    holder_id: String,
    hold_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
struct AcquireHoldResponse {
    lock_id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ReleaseHoldResponse {
    released: bool,
}

#[derive(Debug, Deserialize)]
struct GridQuery {
    date: NaiveDate,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/holds", post(acquire_hold))
        .route("/v1/holds/{lock_id}", delete(release_hold))
        .route("/v1/owners/{owner_id}/holds", get(list_holds))
}

async fn acquire_hold(
    State(state): State<AppState>,
    Json(req): Json<AcquireHoldRequest>,
) -> Result<(StatusCode, Json<AcquireHoldResponse>), AppError> {
    let range = TimeRange::new(req.start, req.end)?;
    let hold = state
        .engine
        .locks
        .acquire(HoldRequest {
            key: SlotKey { owner_id: req.owner_id, resource_id: req.resource_id, date: req.date },
            range,
            holder_id: req.holder_id,
            hold_minutes: req.hold_minutes,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(AcquireHoldResponse { lock_id: hold.id, expires_at: hold.expires_at })))
}

async fn release_hold(
    State(state): State<AppState>,
    Path(lock_id): Path<Uuid>,
) -> Result<Json<ReleaseHoldResponse>, AppError> {
    let released = state.engine.locks.release(lock_id).await?;
    Ok(Json(ReleaseHoldResponse { released }))
}

async fn list_holds(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
    Query(query): Query<GridQuery>,
) -> Result<Json<SlotGrid>, AppError> {
    Ok(Json(state.engine.grid(owner_id, query.date).await?))
}
