use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::repository::StoreResult;
use crate::retry::RetryPolicy;

/// Per-club parameters of the reservation engine, owned by the club
/// administration side of the product.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClubConfig {
    #[serde(default = "default_hold_minutes")]
    pub hold_minutes: i64,
    #[serde(default = "default_payment_deadline_minutes")]
    pub payment_deadline_minutes: i64,
    #[serde(default = "default_split_manage_minutes")]
    pub split_manage_minutes: i64,
    #[serde(default = "default_split_payment_deadline_minutes")]
    pub split_payment_deadline_minutes: i64,
    #[serde(default = "default_refund_days")]
    pub refund_days: i64,
    #[serde(default)]
    pub allow_incomplete_bookings: bool,
}

fn default_hold_minutes() -> i64 { 10 }
fn default_payment_deadline_minutes() -> i64 { 60 }
fn default_split_manage_minutes() -> i64 { 30 }
fn default_split_payment_deadline_minutes() -> i64 { 1440 }
fn default_refund_days() -> i64 { 7 }

impl Default for ClubConfig {
    fn default() -> Self {
        Self {
            hold_minutes: default_hold_minutes(),
            payment_deadline_minutes: default_payment_deadline_minutes(),
            split_manage_minutes: default_split_manage_minutes(),
            split_payment_deadline_minutes: default_split_payment_deadline_minutes(),
            refund_days: default_refund_days(),
            allow_incomplete_bookings: false,
        }
    }
}

/// Read-only source of club configuration. Implementations fall back to the
/// defaults when a club has no configuration row.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn get_config(&self, owner_id: Uuid) -> StoreResult<ClubConfig>;
}

/// Process-wide engine knobs, independent of any club.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub idempotency_retention: chrono::Duration,
    pub payment_link_base: String,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            idempotency_retention: chrono::Duration::hours(24),
            payment_link_base: "http://localhost:8080".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}
