//! PostgreSQL database layer for Kiln.
//!
//! The `Pg*` repositories are the production adapters; [`memory`] holds
//! in-process adapters with the same conditional-update semantics.

pub mod config;
pub mod memory;
pub mod repositories;

pub use config::DatabaseConfig;
pub use repositories::*;

use kiln_core::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database with default pool settings.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with(&DatabaseConfig::new(database_url)).await
    }

    /// Connect to the database.
    pub async fn connect_with(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| kiln_core::Error::Database(e.to_string()))?;

        info!(max_connections = config.max_connections, "Connected to database");
        Ok(Self { pool })
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| kiln_core::Error::Database(e.to_string()))?;
        Ok(())
    }
}
