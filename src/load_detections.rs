//! Load the detection CSV into `raw_yolo_detections`.
//!
//! The CSV is a full snapshot of the image folder, so each load replaces the
//! table's contents. A missing CSV means enrichment has not run yet and is
//! not an error.

use std::path::Path;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::models::DetectionRow;

/// Read every row of the detection CSV at `path`.
pub fn read_detections(path: &Path) -> Result<Vec<DetectionRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for (i, row) in reader.deserialize().enumerate() {
        let row: DetectionRow =
            row.with_context(|| format!("Malformed row {} in {}", i + 1, path.display()))?;
        rows.push(row);
    }
    Ok(rows)
}

async fn ensure_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_yolo_detections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            image_path TEXT NOT NULL,
            channel_name TEXT NOT NULL,
            message_id INTEGER NOT NULL,
            detected_objects TEXT NOT NULL,
            confidence_scores TEXT NOT NULL,
            avg_confidence REAL,
            classification TEXT NOT NULL,
            loaded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Replace `raw_yolo_detections` with the rows in `csv_path`. Returns the
/// number of rows loaded, or `None` when the CSV does not exist.
pub async fn load_detection_csv(pool: &SqlitePool, csv_path: &Path) -> Result<Option<usize>> {
    if !csv_path.exists() {
        warn!(file = %csv_path.display(), "no detection CSV, run enrich first");
        return Ok(None);
    }

    let rows = read_detections(csv_path)?;
    ensure_table(pool).await?;

    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM raw_yolo_detections")
        .execute(&mut *tx)
        .await?;

    for row in &rows {
        sqlx::query(
            r#"
            INSERT INTO raw_yolo_detections
                (image_path, channel_name, message_id, detected_objects,
                 confidence_scores, avg_confidence, classification, loaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.image_path)
        .bind(&row.channel_name)
        .bind(row.message_id)
        .bind(&row.detected_objects)
        .bind(&row.confidence_scores)
        .bind(row.average_confidence())
        .bind(&row.classification)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    info!(rows = rows.len(), "detections loaded");
    Ok(Some(rows.len()))
}

/// CLI / pipeline entry point for the detection-load stage.
pub async fn run_load_detections(config: &Config) -> Result<Option<usize>> {
    let pool = db::connect(config).await?;
    let loaded = load_detection_csv(&pool, &config.storage.detections_csv).await?;
    pool.close().await;

    match loaded {
        Some(n) => println!("load-detections: {} rows", n),
        None => println!(
            "load-detections: {} not found, nothing loaded",
            config.storage.detections_csv.display()
        ),
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CSV: &str = "image_path,channel_name,message_id,detected_objects,confidence_scores,classification\n\
        images/demo/1.jpg,demo,1,person|bottle,0.90|0.70,Promotional\n\
        images/demo/2.jpg,demo,2,,,Other\n";

    #[tokio::test]
    async fn test_load_replaces_previous_contents() {
        let tmp = TempDir::new().unwrap();
        let pool = db::test_pool(tmp.path()).await;
        let csv_path = tmp.path().join("detections.csv");
        std::fs::write(&csv_path, CSV).unwrap();

        assert_eq!(load_detection_csv(&pool, &csv_path).await.unwrap(), Some(2));
        assert_eq!(load_detection_csv(&pool, &csv_path).await.unwrap(), Some(2));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_yolo_detections")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);

        let avg: Option<f64> = sqlx::query_scalar(
            "SELECT avg_confidence FROM raw_yolo_detections WHERE message_id = 1",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!((avg.unwrap() - 0.80).abs() < 1e-9);

        let empty: Option<f64> = sqlx::query_scalar(
            "SELECT avg_confidence FROM raw_yolo_detections WHERE message_id = 2",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(empty, None);
    }

    #[tokio::test]
    async fn test_missing_csv_is_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let pool = db::test_pool(tmp.path()).await;
        let loaded = load_detection_csv(&pool, &tmp.path().join("absent.csv"))
            .await
            .unwrap();
        assert_eq!(loaded, None);
        assert!(!db::table_exists(&pool, "raw_yolo_detections").await.unwrap());
    }
}
