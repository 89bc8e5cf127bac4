//! Read-only analytical queries over the reporting layer.
//!
//! Every query takes a [`Capabilities`] value describing which reporting
//! tables exist. A missing table is an empty result, decided up front from
//! `sqlite_master`; database errors are never swallowed. The only query with
//! a not-found outcome is [`channel_activity`].

use std::collections::HashMap;

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::config::Config;
use crate::db;
use crate::models::channel_key;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Which reporting tables are available to query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub messages: bool,
    pub detections: bool,
}

impl Capabilities {
    pub async fn detect(pool: &SqlitePool) -> Result<Self, QueryError> {
        let exists = |name: &'static str| async move {
            sqlx::query_scalar::<_, bool>(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?",
            )
            .bind(name)
            .fetch_one(pool)
            .await
        };
        Ok(Self {
            messages: exists("fct_messages").await?,
            detections: exists("fct_image_detections").await?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TermCount {
    pub term: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyActivity {
    pub date: String,
    pub message_count: i64,
    pub total_views: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageHit {
    pub message_id: i64,
    pub channel_name: String,
    pub message_date: String,
    pub message_text: Option<String>,
    pub views: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStat {
    pub image_category: String,
    pub image_count: i64,
    pub avg_confidence: Option<f64>,
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "her", "was", "one",
    "our", "out", "has", "have", "had", "his", "how", "its", "new", "now", "see", "who", "did",
    "get", "got", "may", "use", "with", "this", "that", "from", "they", "will", "your", "what",
    "when", "where", "which", "there", "their", "then", "than", "them", "been", "were", "into",
    "more", "also", "only", "just", "over", "such", "very", "some", "each", "http", "https",
    "www", "com",
];

/// Lowercased alphanumeric runs of at least three characters, stop words
/// removed.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
}

/// Most frequent terms across all message text, highest count first, ties
/// broken alphabetically.
pub async fn top_terms(
    pool: &SqlitePool,
    caps: Capabilities,
    limit: i64,
) -> Result<Vec<TermCount>, QueryError> {
    if limit < 1 {
        return Err(QueryError::InvalidInput("limit must be >= 1".into()));
    }
    if !caps.messages {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = sqlx::query_scalar(
        "SELECT message_text FROM fct_messages WHERE message_text IS NOT NULL AND message_text != ''",
    )
    .fetch_all(pool)
    .await?;

    let mut counts: HashMap<String, i64> = HashMap::new();
    for text in &texts {
        for term in tokenize(text) {
            *counts.entry(term).or_insert(0) += 1;
        }
    }

    let mut terms: Vec<TermCount> = counts
        .into_iter()
        .map(|(term, count)| TermCount { term, count })
        .collect();
    terms.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.term.cmp(&b.term)));
    terms.truncate(limit as usize);
    Ok(terms)
}

/// Per-day message count and view total for one channel, oldest day first.
/// Accepts the channel with or without its leading `@`.
pub async fn channel_activity(
    pool: &SqlitePool,
    caps: Capabilities,
    channel: &str,
) -> Result<Vec<DailyActivity>, QueryError> {
    let key = channel_key(channel);
    if key.is_empty() {
        return Err(QueryError::InvalidInput("channel must not be empty".into()));
    }
    if !caps.messages {
        return Err(QueryError::NotFound(format!("channel not found: {}", channel)));
    }

    let rows = sqlx::query(
        r#"
        SELECT date(message_date) AS day,
               COUNT(*) AS message_count,
               COALESCE(SUM(views), 0) AS total_views
        FROM fct_messages
        WHERE channel_key = ?
        GROUP BY day
        ORDER BY day
        "#,
    )
    .bind(&key)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Err(QueryError::NotFound(format!("channel not found: {}", channel)));
    }

    rows.iter()
        .map(|row| -> Result<DailyActivity, QueryError> {
            Ok(DailyActivity {
                date: row.try_get("day")?,
                message_count: row.try_get("message_count")?,
                total_views: row.try_get("total_views")?,
            })
        })
        .collect()
}

/// Messages whose text contains `keyword` (case-insensitive), newest first,
/// at most `limit` rows.
pub async fn search_messages(
    pool: &SqlitePool,
    caps: Capabilities,
    keyword: &str,
    limit: i64,
) -> Result<Vec<MessageHit>, QueryError> {
    let keyword = keyword.trim();
    if keyword.is_empty() {
        return Err(QueryError::InvalidInput("query must not be empty".into()));
    }
    if limit < 1 {
        return Err(QueryError::InvalidInput("limit must be >= 1".into()));
    }
    if !caps.messages {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT f.message_id, c.channel_name, f.message_date, f.message_text, f.views
        FROM fct_messages f
        JOIN dim_channels c ON c.channel_key = f.channel_key
        WHERE instr(lower(f.message_text), lower(?)) > 0
        ORDER BY f.message_date DESC, f.message_id DESC
        LIMIT ?
        "#,
    )
    .bind(keyword)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<MessageHit, QueryError> {
            Ok(MessageHit {
                message_id: row.try_get("message_id")?,
                channel_name: row.try_get("channel_name")?,
                message_date: row.try_get("message_date")?,
                message_text: row.try_get("message_text")?,
                views: row.try_get("views")?,
            })
        })
        .collect()
}

/// Image count and average detection confidence per category.
pub async fn visual_content(
    pool: &SqlitePool,
    caps: Capabilities,
) -> Result<Vec<CategoryStat>, QueryError> {
    if !caps.detections {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT image_category,
               COUNT(*) AS image_count,
               AVG(avg_confidence) AS avg_confidence
        FROM fct_image_detections
        GROUP BY image_category
        ORDER BY image_count DESC, image_category
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<CategoryStat, QueryError> {
            Ok(CategoryStat {
                image_category: row.try_get("image_category")?,
                image_count: row.try_get("image_count")?,
                avg_confidence: row.try_get("avg_confidence")?,
            })
        })
        .collect()
}

/// Which query `tgw query` should run.
#[derive(Debug, Clone)]
pub enum QueryCommand {
    TopTerms { limit: Option<i64> },
    Activity { channel: String },
    Search { keyword: String, limit: Option<i64> },
    Categories,
}

/// CLI entry point: run one query and print its rows.
pub async fn run_query(config: &Config, command: QueryCommand) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let caps = Capabilities::detect(&pool).await?;

    match command {
        QueryCommand::TopTerms { limit } => {
            let terms = top_terms(&pool, caps, limit.unwrap_or(config.api.default_top_limit)).await?;
            if terms.is_empty() {
                println!("No results.");
            }
            for (i, t) in terms.iter().enumerate() {
                println!("{:>3}. {:<24} {}", i + 1, t.term, t.count);
            }
        }
        QueryCommand::Activity { channel } => {
            let days = channel_activity(&pool, caps, &channel).await?;
            println!("{:<12} {:>9} {:>12}", "date", "messages", "views");
            for d in &days {
                println!("{:<12} {:>9} {:>12}", d.date, d.message_count, d.total_views);
            }
        }
        QueryCommand::Search { keyword, limit } => {
            let max = config.api.max_search_results;
            let hits = search_messages(&pool, caps, &keyword, limit.unwrap_or(max).min(max)).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for h in &hits {
                let text = h.message_text.as_deref().unwrap_or("");
                let snippet: String = text.chars().take(80).collect();
                println!("{}  {} #{}  {}", h.message_date, h.channel_name, h.message_id, snippet.replace('\n', " "));
            }
        }
        QueryCommand::Categories => {
            let stats = visual_content(&pool, caps).await?;
            if stats.is_empty() {
                println!("No detections loaded.");
            }
            for s in &stats {
                println!(
                    "{:<16} {:>6}  avg confidence {}",
                    s.image_category,
                    s.image_count,
                    s.avg_confidence
                        .map(|c| format!("{:.2}", c))
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
    }

    pool.close().await;
    Ok(())
}
