//! Schema migrations and pool bootstrap.
//!
//! The ledger tables live in `echo_core/migrations/` and are embedded into the
//! binary, so the server and the integration tests share one schema source.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Run all embedded database migrations against the given pool.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Open a pool against `url` and bring the schema up to date.
pub async fn connect_and_migrate(
    url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::migrate::MigrateError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(url)
        .await?;
    info!(max_connections, "running database migrations");
    migrate(&pool).await?;
    Ok(pool)
}
