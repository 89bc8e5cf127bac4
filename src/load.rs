//! Raw warehouse loader.
//!
//! Walks `<raw_root>/<YYYY-MM-DD>/<channel>.json` in date order and inserts
//! every record into `raw_telegram_messages`. The whole run is one
//! transaction: either every new record is committed together with its
//! `load_runs` row, or nothing is. Records already present (same
//! `(message_id, channel_name)`) are skipped, so re-running over the same
//! landing tree is a no-op.
//!
//! One malformed file aborts the run and rolls everything back; fix or
//! remove the file and load again.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::db;
use crate::landing::read_batch;
use crate::migrate;
use crate::models::RawMessageRecord;

/// Storage format for `message_date`; sortable and understood by SQLite's
/// date functions.
pub const WAREHOUSE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub files: usize,
    pub records: usize,
    pub inserted: usize,
    pub skipped: usize,
}

/// Landed batch files under `raw_root`, ordered by day then channel.
///
/// Directories whose name is not a date are ignored.
pub fn discover_batches(raw_root: &Path) -> Vec<PathBuf> {
    if !raw_root.exists() {
        return Vec::new();
    }

    WalkDir::new(raw_root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
        .filter(|entry| {
            let day = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .and_then(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").ok());
            if day.is_none() {
                debug!(file = %entry.path().display(), "skipping file outside a date directory");
            }
            day.is_some()
        })
        .map(|entry| entry.into_path())
        .collect()
}

/// Load every landed batch under `raw_root` in a single transaction.
pub async fn load_landed(pool: &SqlitePool, raw_root: &Path) -> Result<LoadStats> {
    let files = discover_batches(raw_root);
    if files.is_empty() {
        warn!(root = %raw_root.display(), "no landed batches found");
    }

    let started_at = Utc::now().timestamp();
    let mut stats = LoadStats::default();
    let mut tx = pool.begin().await?;

    for file in &files {
        let records = read_batch(file)?;
        let mut file_inserted = 0;

        for record in &records {
            if insert_record(&mut tx, record)
                .await
                .with_context(|| format!("Failed to load {}", file.display()))?
            {
                file_inserted += 1;
            } else {
                stats.skipped += 1;
            }
        }

        debug!(file = %file.display(), records = records.len(), inserted = file_inserted, "loaded batch");
        stats.files += 1;
        stats.records += records.len();
        stats.inserted += file_inserted;
    }

    sqlx::query(
        "INSERT INTO load_runs (started_at, finished_at, files, records, inserted) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(started_at)
    .bind(Utc::now().timestamp())
    .bind(stats.files as i64)
    .bind(stats.records as i64)
    .bind(stats.inserted as i64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(
        files = stats.files,
        records = stats.records,
        inserted = stats.inserted,
        skipped = stats.skipped,
        "load complete"
    );
    Ok(stats)
}

/// Insert one record unless its `(message_id, channel_name)` is already
/// present. Returns whether a row was written.
async fn insert_record(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    record: &RawMessageRecord,
) -> Result<bool> {
    let views = i64::try_from(record.views)
        .with_context(|| format!("views out of range for message {}", record.message_id))?;
    let forwards = i64::try_from(record.forwards)
        .with_context(|| format!("forwards out of range for message {}", record.message_id))?;

    let result = sqlx::query(
        r#"
        INSERT INTO raw_telegram_messages
            (message_id, channel_name, message_date, message_text, has_media,
             image_path, views, forwards, ingested_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(message_id, channel_name) DO NOTHING
        "#,
    )
    .bind(record.message_id)
    .bind(&record.channel_name)
    .bind(record.message_date.format(WAREHOUSE_DATE_FORMAT).to_string())
    .bind(&record.message_text)
    .bind(record.has_media)
    .bind(&record.image_path)
    .bind(views)
    .bind(forwards)
    .bind(Utc::now().timestamp())
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// CLI / pipeline entry point for the load stage.
pub async fn run_load(config: &Config) -> Result<LoadStats> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let stats = load_landed(&pool, &config.storage.raw_messages).await?;
    pool.close().await;

    println!(
        "load: {} files, {} records, {} inserted, {} already present",
        stats.files, stats.records, stats.inserted, stats.skipped
    );
    Ok(stats)
}
