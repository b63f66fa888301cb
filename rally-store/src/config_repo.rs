use async_trait::async_trait;
use rally_core::{ClubConfig, ConfigProvider, StoreResult};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::database::map_sqlx_error;

#[derive(sqlx::FromRow)]
struct ClubConfigRow {
    hold_minutes: Option<i64>,
    payment_deadline_minutes: Option<i64>,
    split_manage_minutes: Option<i64>,
    split_payment_deadline_minutes: Option<i64>,
    refund_days: Option<i64>,
    allow_incomplete_bookings: Option<bool>,
}

impl ClubConfigRow {
    /// Unset columns inherit from `defaults`.
    fn merge_onto(self, defaults: &ClubConfig) -> ClubConfig {
        ClubConfig {
            hold_minutes: self.hold_minutes.unwrap_or(defaults.hold_minutes),
            payment_deadline_minutes: self
                .payment_deadline_minutes
                .unwrap_or(defaults.payment_deadline_minutes),
            split_manage_minutes: self.split_manage_minutes.unwrap_or(defaults.split_manage_minutes),
            split_payment_deadline_minutes: self
                .split_payment_deadline_minutes
                .unwrap_or(defaults.split_payment_deadline_minutes),
            refund_days: self.refund_days.unwrap_or(defaults.refund_days),
            allow_incomplete_bookings: self
                .allow_incomplete_bookings
                .unwrap_or(defaults.allow_incomplete_bookings),
        }
    }
}

/// Club configuration from `club_configs`, falling back to the process-wide
/// defaults for clubs without a row.
pub struct PgConfigProvider {
    pool: PgPool,
    defaults: ClubConfig,
}

impl PgConfigProvider {
    pub fn new(pool: PgPool, defaults: ClubConfig) -> Self {
        Self { pool, defaults }
    }
}

#[async_trait]
impl ConfigProvider for PgConfigProvider {
    async fn get_config(&self, owner_id: Uuid) -> StoreResult<ClubConfig> {
        let row = sqlx::query_as::<_, ClubConfigRow>(
            r#"
            SELECT hold_minutes, payment_deadline_minutes, split_manage_minutes,
                   split_payment_deadline_minutes, refund_days, allow_incomplete_bookings
            FROM club_configs WHERE owner_id = $1
            "#,
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => Ok(row.merge_onto(&self.defaults)),
            None => {
                debug!(%owner_id, "no club configuration, using defaults");
                Ok(self.defaults.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_columns_inherit_defaults() {
        let row = ClubConfigRow {
            hold_minutes: Some(5),
            payment_deadline_minutes: None,
            split_manage_minutes: None,
            split_payment_deadline_minutes: None,
            refund_days: Some(14),
            allow_incomplete_bookings: None,
        };
        let merged = row.merge_onto(&ClubConfig::default());
        assert_eq!(merged.hold_minutes, 5);
        assert_eq!(merged.refund_days, 14);
        assert_eq!(merged.payment_deadline_minutes, 60);
        assert!(!merged.allow_incomplete_bookings);
    }
}
