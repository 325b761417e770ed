use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::Config;

/// Connect the read-only pool used by the query runner. Every connection is
/// pinned read-only at the session level, on top of whatever the replica
/// itself enforces.
pub async fn connect_read_only(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db.pool_size)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET default_transaction_read_only = on")
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&config.db.read_url)
        .await?;

    Ok(pool)
}

/// Connect the pool backing the cache and analytics tables. Falls back to
/// the read replica URL for single-database deployments.
pub async fn connect_cache(config: &Config) -> Result<PgPool> {
    let url = config.db.cache_url.as_deref().unwrap_or(&config.db.read_url);

    let pool = PgPoolOptions::new()
        .max_connections(config.db.pool_size.min(5))
        .connect(url)
        .await?;

    Ok(pool)
}
