use rally_core::{ClubConfig, EngineSettings, RetryPolicy};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Club parameters used when a club has no configuration of its own.
    #[serde(default)]
    pub defaults: ClubConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
}

fn default_rate_limit() -> i64 { 120 }

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub kind: StoreKind,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 20 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_idempotency_retention_hours")]
    pub idempotency_retention_hours: i64,
    #[serde(default = "default_payment_link_base")]
    pub payment_link_base: String,
}

fn default_sweep_interval_secs() -> u64 { 60 }
fn default_cache_ttl_secs() -> u64 { 30 }
fn default_retry_attempts() -> usize { 3 }
fn default_retry_backoff_ms() -> u64 { 50 }
fn default_idempotency_retention_hours() -> i64 { 24 }
fn default_payment_link_base() -> String { "http://localhost:8080".into() }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            idempotency_retention_hours: default_idempotency_retention_hours(),
            payment_link_base: default_payment_link_base(),
        }
    }
}

impl EngineConfig {
    pub fn to_settings(&self) -> Result<EngineSettings, config::ConfigError> {
        let idempotency_retention = chrono::Duration::try_hours(self.idempotency_retention_hours)
            .filter(|retention| *retention > chrono::Duration::zero())
            .ok_or_else(|| {
                config::ConfigError::Message(format!(
                    "engine.idempotency_retention_hours out of range: {}",
                    self.idempotency_retention_hours
                ))
            })?;
        Ok(EngineSettings {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            idempotency_retention,
            payment_link_base: self.payment_link_base.trim_end_matches('/').to_string(),
            retry: RetryPolicy::new(
                self.retry_attempts,
                Duration::from_millis(self.retry_backoff_ms),
            ),
        })
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides.
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Never checked in.
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `RALLY__ENGINE__CACHE_TTL_SECS=5`
            .add_source(config::Environment::with_prefix("RALLY").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_settings_follow_configured_values() {
        let engine = EngineConfig {
            cache_ttl_secs: 5,
            retry_attempts: 0,
            payment_link_base: "https://pay.example.com/".into(),
            ..EngineConfig::default()
        };
        let settings = engine.to_settings().unwrap();
        assert_eq!(settings.cache_ttl, Duration::from_secs(5));
        assert_eq!(settings.retry.max_attempts, 1);
        assert_eq!(settings.payment_link_base, "https://pay.example.com");
        assert_eq!(settings.idempotency_retention, chrono::Duration::hours(24));
    }

    #[test]
    fn unrepresentable_retention_is_a_config_error() {
        for hours in [0, -1, i64::MAX] {
            let engine = EngineConfig { idempotency_retention_hours: hours, ..EngineConfig::default() };
            assert!(engine.to_settings().is_err());
        }
    }

    #[test]
    fn layered_sources_deserialize() {
        let raw = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [server]
                port = 9000

                [store]
                kind = "memory"

                [defaults]
                hold_minutes = 15
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: Config = raw.try_deserialize().unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert!(config.database.is_none());
        assert_eq!(config.defaults.hold_minutes, 15);
        assert_eq!(config.defaults.refund_days, 7);
        assert_eq!(config.engine.sweep_interval_secs, 60);
    }
}
