use rally_booking::SlotEngine;
use rally_store::RedisClient;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SlotEngine>,
    /// Rate limiting is skipped when absent.
    pub redis: Option<Arc<RedisClient>>,
    pub rate_limit_per_minute: i64,
}
