use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rally_core::CoreError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),
    /// Malformed request, rejected before reaching the engine.
    #[error("{0}")]
    BadRequest(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Core(err) => match err {
                CoreError::SlotTaken(_) => StatusCode::CONFLICT,
                CoreError::LockNotFound(_) | CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                CoreError::LockExpired(_) => StatusCode::GONE,
                CoreError::Validation(_) => StatusCode::BAD_REQUEST,
                CoreError::InvalidState(_) => StatusCode::CONFLICT,
                CoreError::Contention(_) => StatusCode::SERVICE_UNAVAILABLE,
                CoreError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "VALIDATION",
            AppError::Core(err) => err.code(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Core(CoreError::Store(detail)) => {
                tracing::error!("Internal Server Error: {}", detail);
                "Internal Server Error".to_string()
            }
            AppError::Core(CoreError::Contention(detail)) => {
                tracing::warn!("Store contention exhausted retries: {}", detail);
                "Service busy, please retry".to_string()
            }
            other => {
                tracing::debug!(code = other.code(), "request rejected: {}", other);
                other.to_string()
            }
        };

        let mut body = json!({
            "error": self.code(),
            "message": message,
        });
        if let AppError::Core(CoreError::SlotTaken(conflict)) = &self {
            body["conflict"] = json!(conflict);
        }

        (status, Json(body)).into_response()
    }
}
