pub mod config;
pub mod events;
pub mod models;
pub mod repository;
pub mod retry;

pub use config::{ClubConfig, ConfigProvider, EngineSettings};
pub use events::{EventPublisher, NoopPublisher};
pub use models::*;
pub use repository::{
    BookingRepository, HoldRepository, IdempotencyRepository, ShareMark, ShareRepository,
    StoreError, StoreResult,
};
pub use retry::RetryPolicy;

use uuid::Uuid;

/// Outcomes of engine operations. Everything except `Contention` and `Store`
/// is an expected, user-facing result and is not logged as an error.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("slot taken by an existing {}", .0.kind)]
    SlotTaken(Conflict),
    #[error("hold not found: {0}")]
    LockNotFound(Uuid),
    #[error("hold expired: {0}")]
    LockExpired(Uuid),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("store contention persisted after retries: {0}")]
    Contention(String),
    #[error("store failure: {0}")]
    Store(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::SlotTaken(_) => "SLOT_TAKEN",
            CoreError::LockNotFound(_) => "LOCK_NOT_FOUND",
            CoreError::LockExpired(_) => "LOCK_EXPIRED",
            CoreError::Validation(_) => "VALIDATION",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::InvalidState(_) => "INVALID_STATE",
            CoreError::Contention(_) => "TRANSIENT_STORE_CONTENTION",
            CoreError::Store(_) => "STORE_FAILURE",
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => CoreError::Contention(msg),
            other => CoreError::Store(other.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
