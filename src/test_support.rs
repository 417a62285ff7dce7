//! Test helpers: disposable Postgres databases for integration tests.
//!
//! `TestDatabase` provisions a fresh, migrated database per test, either on
//! a server named by `TEST_DATABASE_URL` or in a throwaway container.
//! Integration tests treat a container-provisioning failure as "no
//! container runtime here" and skip.

use log::LevelFilter;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool};
use testcontainers::core::error::TestcontainersError;
use testcontainers::core::WaitFor;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use thiserror::Error;
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum TestDatabaseError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("container error: {0}")]
    Container(#[from] TestcontainersError),
}

impl TestDatabaseError {
    /// True when the failure means no container runtime is available, as
    /// opposed to a real test failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TestDatabaseError::Container(_))
    }
}

/// Ephemeral database factory for integration tests.
pub struct TestDatabase {
    pool: Option<PgPool>,
    admin_options: PgConnectOptions,
    database_name: String,
    container: Option<ContainerAsync<GenericImage>>,
}

impl TestDatabase {
    /// Provision a fresh migrated database. Uses the server at
    /// `TEST_DATABASE_URL` when set, otherwise launches a disposable
    /// Postgres container.
    pub async fn new() -> Result<Self, TestDatabaseError> {
        let (admin_url, container) = match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => (url, None),
            Err(_) => {
                let (url, container) = Self::start_container().await?;
                (url, Some(container))
            }
        };

        let base_options: PgConnectOptions =
            admin_url.parse().map_err(TestDatabaseError::Sqlx)?;
        let base_options = base_options.log_statements(LevelFilter::Off);
        let admin_options = base_options.clone().database("postgres");

        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(admin_options.clone())
            .await?;

        let database_name = format!("mailstore_test_{}", Uuid::new_v4().simple());
        let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", database_name);
        sqlx::query(&create_sql).execute(&admin_pool).await?;
        admin_pool.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(base_options.database(&database_name))
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self {
            pool: Some(pool),
            admin_options,
            database_name,
            container,
        })
    }

    async fn start_container() -> Result<(String, ContainerAsync<GenericImage>), TestcontainersError>
    {
        let image = GenericImage::new("postgres", "16-alpine")
            .with_wait_for(WaitFor::message_on_stdout(
                "PostgreSQL init process complete",
            ))
            .with_wait_for(WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ));

        let container = image
            .with_env_var("POSTGRES_DB", "postgres")
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .start()
            .await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);
        Ok((url, container))
    }

    /// The pooled connection handle for the test database.
    pub fn pool(&self) -> &PgPool {
        self.pool.as_ref().expect("test database pool is available")
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool().clone()
    }

    /// Close pool connections and drop the ephemeral database.
    pub async fn close(mut self) -> Result<(), TestDatabaseError> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }

        if self.container.is_none() {
            // Only worth cleaning up on a shared server; a container dies
            // with the test anyway.
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(self.admin_options.clone())
                .await?;
            let drop_sql = format!("DROP DATABASE IF EXISTS \"{}\"", self.database_name);
            sqlx::query(&drop_sql).execute(&admin_pool).await?;
            admin_pool.close().await;
        }

        if let Some(container) = self.container.take() {
            drop(container);
        }

        Ok(())
    }
}
