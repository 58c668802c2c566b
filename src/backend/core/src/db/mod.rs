//! PostgreSQL connection pooling.

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::config::EventStoreConfig;
use crate::error::{ErrorCode, ModulithError, Result};

/// Create a connection pool from the event store configuration.
pub async fn connect(config: &EventStoreConfig) -> Result<PgPool> {
    let url = config.url.as_deref().ok_or_else(|| {
        ModulithError::new(
            ErrorCode::MissingConfiguration,
            "event_store.url is required to connect to PostgreSQL",
        )
    })?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect(url)
        .await
        .map_err(|e| {
            ModulithError::with_internal(
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
                e.to_string(),
            )
            .with_source(e)
        })?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database pool ready"
    );
    Ok(pool)
}

/// Round-trip a trivial query to check the pool is usable.
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
