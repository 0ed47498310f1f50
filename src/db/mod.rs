use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;
use crate::error::Error;

pub mod models;
pub mod repositories;

/// Database service for handling connections
pub struct DatabaseService {
    pub pool: Arc<PgPool>,
}

impl DatabaseService {
    /// Create a new database service
    pub async fn new(config: &DatabaseConfig) -> Result<Self, Error> {
        info!("connecting to database");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect to database: {}", e)))?;

        info!("connected to PostgreSQL database");

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Health check for database
    pub async fn health_check(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&*self.pool).await {
            Ok(_) => true,
            Err(e) => {
                error!("database health check failed: {}", e);
                false
            }
        }
    }
}
