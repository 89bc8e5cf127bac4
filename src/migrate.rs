use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the raw landing tables. Idempotent.
///
/// `raw_yolo_detections` is deliberately not created here: it only exists
/// once detections have been loaded, and downstream readers treat its
/// absence as "no detections yet".
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_telegram_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id INTEGER NOT NULL,
            channel_name TEXT NOT NULL,
            message_date TEXT NOT NULL,
            message_text TEXT,
            has_media INTEGER NOT NULL DEFAULT 0,
            image_path TEXT,
            views INTEGER NOT NULL DEFAULT 0 CHECK (views >= 0),
            forwards INTEGER NOT NULL DEFAULT 0 CHECK (forwards >= 0),
            ingested_at INTEGER NOT NULL,
            UNIQUE(message_id, channel_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS load_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            files INTEGER NOT NULL,
            records INTEGER NOT NULL,
            inserted INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_messages_channel ON raw_telegram_messages(channel_name)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_messages_date ON raw_telegram_messages(message_date DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
