//! Warehouse connection handling.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteExecutor;
use std::str::FromStr;

use crate::config::Config;

/// Open (creating if needed) the SQLite warehouse configured in `[db].path`.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open warehouse at {}", db_path.display()))?;

    Ok(pool)
}

/// Whether a table (or view) with this name exists in the warehouse.
pub async fn table_exists<'e, E>(executor: E, name: &str) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?",
    )
    .bind(name)
    .fetch_one(executor)
    .await?;
    Ok(exists)
}

/// Fresh migrated warehouse in `dir`, for unit tests.
#[cfg(test)]
pub(crate) async fn test_pool(dir: &std::path::Path) -> SqlitePool {
    let config: Config = toml::from_str(&format!(
        "[db]\npath = \"{}\"\n",
        dir.join("warehouse.sqlite").display()
    ))
    .unwrap();
    let pool = connect(&config).await.unwrap();
    crate::migrate::apply(&pool).await.unwrap();
    pool
}
