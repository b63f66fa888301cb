use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use rally_booking::{Invite, PaymentOutcome, ShareLocator};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct RecordPaymentRequest {
    share_id: Option<Uuid>,
    invite_token: Option<String>,
    payment_reference: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/payments", post(record_payment))
        .route("/v1/invites/{token}", get(get_invite))
}

async fn record_payment(
    State(state): State<AppState>,
    Json(req): Json<RecordPaymentRequest>,
) -> Result<Json<PaymentOutcome>, AppError> {
    let locator = match (req.share_id, req.invite_token) {
        (Some(id), None) => ShareLocator::ShareId(id),
        (None, Some(token)) if !token.trim().is_empty() => ShareLocator::InviteToken(token),
        _ => {
            return Err(AppError::BadRequest(
                "exactly one of share_id or invite_token is required".into(),
            ))
        }
    };
    let reference = req.payment_reference.filter(|r| !r.trim().is_empty());
    Ok(Json(state.engine.payments.record_payment(locator, reference).await?))
}

async fn get_invite(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<Invite>, AppError> {
    Ok(Json(state.engine.payments.invite(&token).await?))
}
