//! Reporting layer: dimension and fact tables derived from the raw tables.
//!
//! `build` drops and rebuilds every reporting table in one transaction, so
//! readers see either the previous build or the new one. The layout:
//!
//! | Table | Grain | Key |
//! |-------|-------|-----|
//! | `dim_channels` | channel | `channel_key` |
//! | `dim_dates` | calendar day with messages | `date_key` (`YYYYMMDD`) |
//! | `fct_messages` | message | `message_key` (`<channel_key>_<message_id>`) |
//! | `fct_image_detections` | detected image joined to its message | `message_key` |
//!
//! `channel_key` is the channel name lowercased with the `@` removed, which
//! is also how detection rows name their channel. `fct_image_detections` is
//! only built when `raw_yolo_detections` exists.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::migrate;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportStats {
    pub channels: i64,
    pub dates: i64,
    pub messages: i64,
    /// `None` when there were no detections to report on.
    pub image_detections: Option<i64>,
}

/// Result of one data check; `failures == 0` means it passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub failures: i64,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.failures == 0
    }
}

const DROP_TABLES: &[&str] = &[
    "DROP TABLE IF EXISTS fct_image_detections",
    "DROP TABLE IF EXISTS fct_messages",
    "DROP TABLE IF EXISTS dim_dates",
    "DROP TABLE IF EXISTS dim_channels",
];

const CREATE_DIM_CHANNELS: &str = r#"
CREATE TABLE dim_channels (
    channel_key TEXT PRIMARY KEY,
    channel_name TEXT NOT NULL,
    first_post_date TEXT NOT NULL,
    last_post_date TEXT NOT NULL,
    total_posts INTEGER NOT NULL,
    avg_views REAL NOT NULL
)
"#;

const FILL_DIM_CHANNELS: &str = r#"
INSERT INTO dim_channels
SELECT
    lower(ltrim(channel_name, '@')),
    MIN(channel_name),
    MIN(message_date),
    MAX(message_date),
    COUNT(*),
    AVG(views)
FROM raw_telegram_messages
GROUP BY lower(ltrim(channel_name, '@'))
"#;

const CREATE_DIM_DATES: &str = r#"
CREATE TABLE dim_dates (
    date_key INTEGER PRIMARY KEY,
    full_date TEXT NOT NULL,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    day INTEGER NOT NULL,
    day_of_week INTEGER NOT NULL,
    week_of_year INTEGER NOT NULL,
    is_weekend INTEGER NOT NULL
)
"#;

const FILL_DIM_DATES: &str = r#"
INSERT INTO dim_dates
SELECT DISTINCT
    CAST(strftime('%Y%m%d', message_date) AS INTEGER),
    date(message_date),
    CAST(strftime('%Y', message_date) AS INTEGER),
    CAST(strftime('%m', message_date) AS INTEGER),
    CAST(strftime('%d', message_date) AS INTEGER),
    CAST(strftime('%w', message_date) AS INTEGER),
    CAST(strftime('%W', message_date) AS INTEGER),
    strftime('%w', message_date) IN ('0', '6')
FROM raw_telegram_messages
"#;

const CREATE_FCT_MESSAGES: &str = r#"
CREATE TABLE fct_messages (
    message_key TEXT PRIMARY KEY,
    message_id INTEGER NOT NULL,
    channel_key TEXT NOT NULL REFERENCES dim_channels(channel_key),
    date_key INTEGER NOT NULL REFERENCES dim_dates(date_key),
    message_date TEXT NOT NULL,
    message_text TEXT,
    message_length INTEGER NOT NULL,
    views INTEGER NOT NULL,
    forwards INTEGER NOT NULL,
    has_image INTEGER NOT NULL
)
"#;

// The loader's uniqueness rule is on the raw channel name; channels that only
// differ by case or '@' collapse here, so keep the first row per key.
const FILL_FCT_MESSAGES: &str = r#"
INSERT OR IGNORE INTO fct_messages
SELECT
    lower(ltrim(channel_name, '@')) || '_' || message_id,
    message_id,
    lower(ltrim(channel_name, '@')),
    CAST(strftime('%Y%m%d', message_date) AS INTEGER),
    message_date,
    message_text,
    length(COALESCE(message_text, '')),
    views,
    forwards,
    image_path IS NOT NULL
FROM raw_telegram_messages
ORDER BY id
"#;

const CREATE_FCT_IMAGE_DETECTIONS: &str = r#"
CREATE TABLE fct_image_detections (
    message_key TEXT NOT NULL REFERENCES fct_messages(message_key),
    channel_key TEXT NOT NULL,
    message_id INTEGER NOT NULL,
    date_key INTEGER NOT NULL,
    detected_objects TEXT NOT NULL,
    confidence_scores TEXT NOT NULL,
    avg_confidence REAL,
    image_category TEXT NOT NULL
)
"#;

const FILL_FCT_IMAGE_DETECTIONS: &str = r#"
INSERT INTO fct_image_detections
SELECT
    f.message_key,
    f.channel_key,
    f.message_id,
    f.date_key,
    d.detected_objects,
    d.confidence_scores,
    d.avg_confidence,
    d.classification
FROM raw_yolo_detections d
JOIN fct_messages f
  ON f.channel_key = lower(ltrim(d.channel_name, '@'))
 AND f.message_id = d.message_id
"#;

async fn count(pool: &SqlitePool, table: &str) -> Result<i64> {
    let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// Rebuild every reporting table from the raw tables.
pub async fn build(pool: &SqlitePool) -> Result<ReportStats> {
    migrate::apply(pool).await?;

    let mut tx = pool.begin().await?;
    let with_detections = db::table_exists(&mut *tx, "raw_yolo_detections").await?;

    for stmt in DROP_TABLES {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }

    let mut steps = vec![
        CREATE_DIM_CHANNELS,
        FILL_DIM_CHANNELS,
        CREATE_DIM_DATES,
        FILL_DIM_DATES,
        CREATE_FCT_MESSAGES,
        FILL_FCT_MESSAGES,
        "CREATE INDEX idx_fct_messages_channel ON fct_messages(channel_key, date_key)",
    ];
    if with_detections {
        steps.push(CREATE_FCT_IMAGE_DETECTIONS);
        steps.push(FILL_FCT_IMAGE_DETECTIONS);
    }
    for stmt in steps {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }

    tx.commit().await?;

    let stats = ReportStats {
        channels: count(pool, "dim_channels").await?,
        dates: count(pool, "dim_dates").await?,
        messages: count(pool, "fct_messages").await?,
        image_detections: if with_detections {
            Some(count(pool, "fct_image_detections").await?)
        } else {
            None
        },
    };

    info!(
        channels = stats.channels,
        dates = stats.dates,
        messages = stats.messages,
        "reporting tables rebuilt"
    );
    Ok(stats)
}

/// Data checks over the reporting tables. Requires a prior [`build`].
pub async fn check(pool: &SqlitePool) -> Result<Vec<CheckResult>> {
    let checks: &[(&'static str, &str)] = &[
        (
            "unique_message_key",
            "SELECT COUNT(*) FROM (SELECT message_key FROM fct_messages GROUP BY message_key HAVING COUNT(*) > 1)",
        ),
        (
            "non_negative_views",
            "SELECT COUNT(*) FROM fct_messages WHERE views < 0",
        ),
        (
            "no_future_messages",
            "SELECT COUNT(*) FROM fct_messages WHERE message_date > datetime('now')",
        ),
        (
            "known_channel",
            "SELECT COUNT(*) FROM fct_messages f LEFT JOIN dim_channels c ON c.channel_key = f.channel_key WHERE c.channel_key IS NULL",
        ),
    ];

    let mut results = Vec::with_capacity(checks.len());
    for &(name, sql) in checks {
        let failures: i64 = sqlx::query_scalar(sql).fetch_one(pool).await?;
        results.push(CheckResult { name, failures });
    }
    Ok(results)
}

/// CLI / pipeline entry point for the report stage. Fails when any data
/// check fails.
pub async fn run_report(config: &Config) -> Result<ReportStats> {
    let pool = db::connect(config).await?;
    let stats = build(&pool).await?;
    let checks = check(&pool).await?;
    pool.close().await;

    println!("report");
    println!("  dim_channels:         {}", stats.channels);
    println!("  dim_dates:            {}", stats.dates);
    println!("  fct_messages:         {}", stats.messages);
    match stats.image_detections {
        Some(n) => println!("  fct_image_detections: {}", n),
        None => println!("  fct_image_detections: (no detections loaded)"),
    }
    println!();
    for c in &checks {
        println!(
            "  {:<20} {}",
            c.name,
            if c.passed() {
                "ok".to_string()
            } else {
                format!("FAILED ({} rows)", c.failures)
            }
        );
    }

    let failed: Vec<&str> = checks.iter().filter(|c| !c.passed()).map(|c| c.name).collect();
    if !failed.is_empty() {
        anyhow::bail!("data checks failed: {}", failed.join(", "));
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn insert_raw(pool: &SqlitePool, channel: &str, id: i64, date: &str, views: i64, image: Option<&str>) {
        sqlx::query(
            "INSERT INTO raw_telegram_messages (message_id, channel_name, message_date, message_text, has_media, image_path, views, forwards, ingested_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0)",
        )
        .bind(id)
        .bind(channel)
        .bind(date)
        .bind(format!("post {}", id))
        .bind(image.is_some())
        .bind(image)
        .bind(views)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_build_dimensions_and_facts() {
        let tmp = TempDir::new().unwrap();
        let pool = db::test_pool(tmp.path()).await;
        insert_raw(&pool, "@Demo", 1, "2024-05-04 10:00:00", 10, None).await;
        insert_raw(&pool, "@Demo", 2, "2024-05-06 11:00:00", 30, Some("images/demo/2.jpg")).await;
        insert_raw(&pool, "@other", 1, "2024-05-06 12:00:00", 5, None).await;

        let stats = build(&pool).await.unwrap();
        assert_eq!(stats.channels, 2);
        assert_eq!(stats.dates, 2);
        assert_eq!(stats.messages, 3);
        assert_eq!(stats.image_detections, None);

        let (posts, avg): (i64, f64) = sqlx::query_as(
            "SELECT total_posts, avg_views FROM dim_channels WHERE channel_key = 'demo'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(posts, 2);
        assert!((avg - 20.0).abs() < 1e-9);

        // 2024-05-04 is a Saturday.
        let weekend: i64 = sqlx::query_scalar("SELECT is_weekend FROM dim_dates WHERE date_key = 20240504")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(weekend, 1);

        let has_image: i64 = sqlx::query_scalar("SELECT has_image FROM fct_messages WHERE message_key = 'demo_2'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(has_image, 1);

        assert!(check(&pool).await.unwrap().iter().all(|c| c.passed()));
    }

    #[tokio::test]
    async fn test_detections_joined_by_channel_key() {
        let tmp = TempDir::new().unwrap();
        let pool = db::test_pool(tmp.path()).await;
        insert_raw(&pool, "@demo", 42, "2024-05-01 10:00:00", 1, Some("images/demo/42.jpg")).await;

        let csv_path = tmp.path().join("d.csv");
        std::fs::write(
            &csv_path,
            "image_path,channel_name,message_id,detected_objects,confidence_scores,classification\n\
             images/demo/42.jpg,demo,42,bottle,0.60,Product Display\n\
             images/demo/99.jpg,demo,99,person,0.70,Lifestyle\n",
        )
        .unwrap();
        crate::load_detections::load_detection_csv(&pool, &csv_path)
            .await
            .unwrap();

        let stats = build(&pool).await.unwrap();
        assert_eq!(stats.image_detections, Some(1));

        let category: String = sqlx::query_scalar("SELECT image_category FROM fct_image_detections")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(category, "Product Display");
    }

    #[tokio::test]
    async fn test_future_dated_message_fails_check() {
        let tmp = TempDir::new().unwrap();
        let pool = db::test_pool(tmp.path()).await;
        insert_raw(&pool, "@demo", 1, "2999-01-01 00:00:00", 1, None).await;

        build(&pool).await.unwrap();
        let checks = check(&pool).await.unwrap();
        let future = checks.iter().find(|c| c.name == "no_future_messages").unwrap();
        assert_eq!(future.failures, 1);
    }

    #[tokio::test]
    async fn test_rebuild_is_repeatable() {
        let tmp = TempDir::new().unwrap();
        let pool = db::test_pool(tmp.path()).await;
        insert_raw(&pool, "@demo", 1, "2024-05-01 10:00:00", 1, None).await;

        let first = build(&pool).await.unwrap();
        let second = build(&pool).await.unwrap();
        assert_eq!(first, second);
    }
}
