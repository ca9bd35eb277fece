//! Postgres connection helpers

use std::path::Path;

use sqlx::{postgres::PgPoolOptions, PgPool, Pool, Postgres};
use tracing::info;

use crate::error::{Error, Result};

/// Database pool type
pub type DbPool = Pool<Postgres>;

/// Initialize the database connection pool
pub async fn init_db_pool(database_url: &str, max_connections: u32) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    info!("Connected to PostgreSQL database");
    Ok(pool)
}

/// Run the workspace migrations on the database
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrations_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .ok_or_else(|| Error::Internal("workspace root not found".to_string()))?
        .join("migrations");

    sqlx::migrate::Migrator::new(migrations_path)
        .await
        .map_err(|e| Error::Internal(format!("failed to load migrations: {}", e)))?
        .run(pool)
        .await
        .map_err(|e| Error::Internal(format!("failed to run migrations: {}", e)))?;

    Ok(())
}
