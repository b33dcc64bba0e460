//! SQLite helpers: pool creation plus sqlx migrations
//!
//! The crate root carries a `migrations/` directory; `sqlx::migrate!()`
//! embeds it and brings the schema up to date on every connect.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tracing::info;

/// True for `sqlite::memory:` style urls, which live inside one connection
pub fn is_memory_url(db_url: &str) -> bool {
    db_url.contains(":memory:") || db_url.contains("mode=memory")
}

/// Creates the SQLite pool and runs every pending migration
pub async fn create_sqlite_pool_with_migration(db_url: &str) -> Result<Pool<Sqlite>> {
    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("invalid SQLite url: {}", db_url))?
        .create_if_missing(true)
        .foreign_keys(true);

    // an in-memory database exists only as long as its single connection
    let pool = if is_memory_url(db_url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
    }
    .with_context(|| format!("failed to connect to SQLite database: {}", db_url))?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .context("failed to run SQLite migrations")?;
    info!("[DB] SQLite ready: {}", db_url);

    Ok(pool)
}
