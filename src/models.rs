//! Core data models shared by the fetch, landing, load and enrichment stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One scraped channel post, as written to a landed batch file.
///
/// Identity is `(message_id, channel_name)`; `message_id` is only unique
/// within a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessageRecord {
    pub message_id: i64,
    pub channel_name: String,
    pub message_date: DateTime<Utc>,
    #[serde(default)]
    pub message_text: Option<String>,
    pub has_media: bool,
    #[serde(default)]
    pub image_path: Option<String>,
    pub views: u64,
    pub forwards: u64,
}

/// A single object found in an image by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub name: String,
    pub confidence: f64,
}

/// Image classification derived from detected objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImageCategory {
    Promotional,
    ProductDisplay,
    Lifestyle,
    Other,
}

impl ImageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageCategory::Promotional => "Promotional",
            ImageCategory::ProductDisplay => "Product Display",
            ImageCategory::Lifestyle => "Lifestyle",
            ImageCategory::Other => "Other",
        }
    }
}

impl fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the detection CSV. Objects and scores are pipe-delimited,
/// scores formatted to two decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRow {
    pub image_path: String,
    pub channel_name: String,
    pub message_id: i64,
    pub detected_objects: String,
    pub confidence_scores: String,
    pub classification: String,
}

impl DetectionRow {
    /// Mean of the pipe-delimited confidence scores, `None` when the image
    /// had no detections.
    pub fn average_confidence(&self) -> Option<f64> {
        let scores: Vec<f64> = self
            .confidence_scores
            .split('|')
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.trim().parse::<f64>().ok())
            .collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }
}

/// Strip the leading `@` from a channel username. Used for on-disk
/// directory names and for the reporting layer's channel key.
pub fn channel_slug(channel: &str) -> &str {
    channel.trim_start_matches('@')
}

/// Case-insensitive identity of a channel: `@Demo`, `demo` and `DEMO` are
/// the same channel.
pub fn channel_key(channel: &str) -> String {
    channel_slug(channel.trim()).to_lowercase()
}
