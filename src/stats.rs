//! Warehouse statistics and health overview.
//!
//! Summarises what has been loaded: raw message counts per channel, how far
//! each channel's checkpoint has advanced, the last load run, and whether
//! detections and reporting tables exist yet. Used by `tgw stats`.

use anyhow::Result;
use sqlx::Row;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::db;
use crate::migrate;

/// Per-channel breakdown of loaded messages.
struct ChannelStats {
    channel: String,
    messages: i64,
    with_image: i64,
    newest_id: i64,
    last_ingested: Option<i64>,
}

/// Run the stats command: query the warehouse and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let total_messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_telegram_messages")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Telegram Warehouse — Stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Messages:    {}", total_messages);

    let detections = if db::table_exists(&pool, "raw_yolo_detections").await? {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_yolo_detections")
            .fetch_one(&pool)
            .await?;
        n.to_string()
    } else {
        "not loaded".to_string()
    };
    println!("  Detections:  {}", detections);
    println!(
        "  Reporting:   {}",
        if db::table_exists(&pool, "fct_messages").await? {
            "built"
        } else {
            "not built"
        }
    );

    let last_run = sqlx::query(
        "SELECT finished_at, files, inserted FROM load_runs ORDER BY id DESC LIMIT 1",
    )
    .fetch_optional(&pool)
    .await?;
    if let Some(run) = last_run {
        println!(
            "  Last load:   {} ({} files, {} inserted)",
            format_ts_relative(run.get("finished_at")),
            run.get::<i64, _>("files"),
            run.get::<i64, _>("inserted")
        );
    } else {
        println!("  Last load:   never");
    }

    let channel_rows = sqlx::query(
        r#"
        SELECT
            channel_name,
            COUNT(*) AS messages,
            SUM(CASE WHEN image_path IS NOT NULL THEN 1 ELSE 0 END) AS with_image,
            MAX(message_id) AS newest_id,
            MAX(ingested_at) AS last_ingested
        FROM raw_telegram_messages
        GROUP BY channel_name
        ORDER BY messages DESC, channel_name
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let channel_stats: Vec<ChannelStats> = channel_rows
        .iter()
        .map(|row| ChannelStats {
            channel: row.get("channel_name"),
            messages: row.get("messages"),
            with_image: row.get("with_image"),
            newest_id: row.get("newest_id"),
            last_ingested: row.get("last_ingested"),
        })
        .collect();

    let checkpoints = CheckpointStore::open(&config.storage.checkpoints)?.snapshot();

    if !channel_stats.is_empty() || !checkpoints.is_empty() {
        println!();
        println!("  By channel:");
        println!(
            "  {:<24} {:>8} {:>7} {:>10} {:>11}   {}",
            "CHANNEL", "MESSAGES", "IMAGES", "NEWEST ID", "CHECKPOINT", "LAST LOAD"
        );
        println!("  {}", "-".repeat(84));

        for s in &channel_stats {
            let checkpoint = checkpoints
                .get(&s.channel)
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            let loaded = match s.last_ingested {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>8} {:>7} {:>10} {:>11}   {}",
                s.channel, s.messages, s.with_image, s.newest_id, checkpoint, loaded
            );
        }

        // Channels that were fetched but never loaded.
        for (channel, checkpoint) in &checkpoints {
            if channel_stats.iter().all(|s| &s.channel != channel) {
                println!(
                    "  {:<24} {:>8} {:>7} {:>10} {:>11}   {}",
                    channel, 0, 0, "-", checkpoint, "never"
                );
            }
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Print the checkpoint file as `channel  last_id` lines.
pub fn run_checkpoints(config: &Config) -> Result<()> {
    let store = CheckpointStore::open(&config.storage.checkpoints)?;
    let snapshot = store.snapshot();
    if snapshot.is_empty() {
        println!("No checkpoints yet ({}).", store.path().display());
        return Ok(());
    }
    for (channel, last_id) in &snapshot {
        println!("{:<32} {}", channel, last_id);
    }
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }
}
