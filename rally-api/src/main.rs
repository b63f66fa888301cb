use anyhow::Context;
use mockable::DefaultClock;
use rally_api::{app, worker, AppState};
use rally_booking::{SlotEngine, Stores};
use rally_core::{EventPublisher, NoopPublisher};
use rally_store::app_config::{Config, StoreKind};
use rally_store::{
    DbClient, KafkaEventPublisher, MemoryStore, PgBookingRepository, PgConfigProvider,
    PgHoldRepository, PgIdempotencyRepository, RedisClient,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rally_api=debug,rally_booking=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Rally API on port {}", config.server.port);

    let settings = config.engine.to_settings().context("Invalid engine settings")?;
    let stores = match config.store.kind {
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory store, nothing survives a restart");
            Stores::shared(Arc::new(MemoryStore::with_defaults(config.defaults.clone())))
        }
        StoreKind::Postgres => {
            let database = config
                .database
                .as_ref()
                .context("store.kind = \"postgres\" requires a [database] section")?;
            let db = DbClient::new(&database.url, database.max_connections)
                .await
                .context("Failed to connect to Postgres")?;
            db.migrate().await.context("Failed to run migrations")?;
            let bookings = Arc::new(PgBookingRepository::new(db.pool.clone()));
            Stores {
                holds: Arc::new(PgHoldRepository::new(db.pool.clone())),
                bookings: bookings.clone(),
                shares: bookings,
                idempotency: Arc::new(PgIdempotencyRepository::new(db.pool.clone())),
                config: Arc::new(PgConfigProvider::new(db.pool.clone(), config.defaults.clone())),
            }
        }
    };

    let events: Arc<dyn EventPublisher> = match &config.kafka {
        Some(kafka) => Arc::new(
            KafkaEventPublisher::new(&kafka.brokers).context("Failed to create Kafka producer")?,
        ),
        None => Arc::new(NoopPublisher),
    };

    let redis = match &config.redis {
        Some(redis) => Some(Arc::new(
            RedisClient::new(&redis.url).context("Failed to create Redis client")?,
        )),
        None => None,
    };

    let engine = Arc::new(SlotEngine::new(stores, events, Arc::new(DefaultClock), &settings));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = worker::spawn_sweeper(engine.sweeper.clone(), settings.sweep_interval, shutdown_rx);

    let app = app(AppState {
        engine,
        redis,
        rate_limit_per_minute: config.server.rate_limit_per_minute,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let _ = shutdown_tx.send(true);
    sweeper.await?;
    Ok(())
}
