use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::MySqlPool;
use std::str::FromStr;
use tracing::info;

use crate::error::StartupError;

/// The initial schema, embedded at compile time.
const INIT_MIGRATION: &str = include_str!("migrations/001_init.sql");

/// Open the MySQL-compatible connection pool and ensure the schema exists.
pub async fn init(database_url: &str) -> Result<MySqlPool, StartupError> {
    let options = MySqlConnectOptions::from_str(database_url).map_err(StartupError::Backend)?;

    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await
        .map_err(StartupError::Backend)?;

    run_migrations(&pool).await?;
    info!("database schema up to date");

    Ok(pool)
}

/// Apply the embedded schema using a simple version-tracking table, the
/// same shape the gateway's callers expect: no compile-time `DATABASE_URL`
/// requirement, and safe to run on every startup.
async fn run_migrations(pool: &MySqlPool) -> Result<(), StartupError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (\
         version INT PRIMARY KEY, \
         applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)",
    )
    .execute(pool)
    .await
    .map_err(StartupError::Backend)?;

    let applied: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM _migrations WHERE version = 1")
        .fetch_optional(pool)
        .await
        .map_err(StartupError::Backend)?;

    if applied.is_none() {
        for statement in INIT_MIGRATION.split(';') {
            let stmt = statement.trim();
            if stmt.is_empty() || stmt.starts_with("--") {
                continue;
            }
            sqlx::query(stmt)
                .execute(pool)
                .await
                .map_err(StartupError::Backend)?;
        }

        sqlx::query("INSERT INTO _migrations (version) VALUES (1)")
            .execute(pool)
            .await
            .map_err(StartupError::Backend)?;

        info!("applied migration 001_init.sql");
    }

    Ok(())
}
