use rally_core::StoreError;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }
}

const UNIQUE_VIOLATION: &str = "23505";
const EXCLUSION_VIOLATION: &str = "23P01";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// Classify a driver error once, at the data-access boundary. Downstream code
/// only ever sees the [`StoreError`] variant.
pub fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            debug!(code = ?code, constraint = ?db.constraint(), "database operation failed");
            match code.as_deref() {
                Some(UNIQUE_VIOLATION) | Some(EXCLUSION_VIOLATION) => StoreError::Conflict {
                    constraint: db.constraint().unwrap_or("unknown").to_string(),
                },
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                    StoreError::Transient(db.message().to_string())
                }
                _ => StoreError::Permanent(err.to_string()),
            }
        }
        sqlx::Error::PoolTimedOut => StoreError::Transient(err.to_string()),
        _ => StoreError::Permanent(err.to_string()),
    }
}

pub(crate) fn corrupt_row(what: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Permanent(format!("corrupt {} row: {}", what, detail))
}
