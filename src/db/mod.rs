//! Database module for SQLite persistence
//!
//! Holds the durable upload records that let an interrupted upload resume
//! after a process restart.

mod records;
mod schema;

pub use records::*;
pub use schema::*;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Open the record database, creating the file and schema on first use
pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(config.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    initialize_schema(&pool).await?;
    tracing::debug!(url = %config.url, "Upload record database ready");

    Ok(pool)
}
