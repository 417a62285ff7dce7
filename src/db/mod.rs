//! Database pool and migrations.

pub mod copy;

use crate::config::DbConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Build the shared handle pool from configuration.
///
/// Handles are long-lived connections, each processing one transaction at a
/// time. `min_connections(1)` keeps a single handle alive through idle
/// periods; extra handles are retired after the configured idle timeout.
pub async fn connect(config: &DbConfig) -> Result<PgPool, sqlx::Error> {
    log::info!(
        "connecting database pool: max {} handles, idle timeout {:?}",
        config.max_handles,
        config.idle_timeout
    );

    PgPoolOptions::new()
        .max_connections(config.max_handles)
        .min_connections(1)
        .acquire_timeout(config.handle_interval)
        .idle_timeout(config.idle_timeout)
        .connect(&config.url)
        .await
}

/// Run database migrations.
/// This is idempotent - migrations that have already been applied will be skipped
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    log::info!("running database migrations");

    sqlx::migrate!("./migrations").run(pool).await?;

    log::info!("database migrations completed");
    Ok(())
}
