pub mod app_config;
pub mod booking_repo;
pub mod config_repo;
pub mod database;
pub mod events;
pub mod hold_repo;
pub mod idempotency_repo;
pub mod memory;
pub mod redis_repo;

pub use booking_repo::PgBookingRepository;
pub use config_repo::PgConfigProvider;
pub use database::DbClient;
pub use events::KafkaEventPublisher;
pub use hold_repo::PgHoldRepository;
pub use idempotency_repo::PgIdempotencyRepository;
pub use memory::{FailPoint, MemoryStore};
pub use redis_repo::RedisClient;
