//! Telegram Desktop export source.
//!
//! Reads channel history from "Export chat history" JSON dumps laid out as
//! `<root>/<channel>/result.json`, where `<channel>` is the username without
//! its leading `@`. Photos are referenced relative to the channel directory.
//! No credentials are needed, which makes this source useful for offline
//! backfills and for exercising the pipeline end to end.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::fsio::write_atomic;
use crate::models::channel_slug;
use crate::source::{ChannelInfo, MessageSource, RemoteMessage, SourceError};

pub struct ExportSource {
    root: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ExportFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    messages: Vec<ExportMessage>,
}

#[derive(Debug, Deserialize)]
struct ExportMessage {
    id: i64,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    date_unixtime: Option<String>,
    #[serde(default)]
    text: Value,
    #[serde(default)]
    photo: Option<String>,
    #[serde(default)]
    views: Option<u64>,
    #[serde(default)]
    forwards: Option<u64>,
}

impl ExportSource {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn channel_dir(&self, channel: &str) -> PathBuf {
        self.root.join(channel_slug(channel))
    }

    async fn read_export(&self, channel: &str) -> Result<ExportFile, SourceError> {
        let path = self.channel_dir(channel).join("result.json");
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(channel.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| SourceError::Malformed(format!("{}: {}", path.display(), e)))
    }
}

/// Flatten the export's `text` field, which is either a plain string or an
/// array of strings and `{ "type": ..., "text": ... }` entity objects.
fn flatten_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part {
                Value::String(s) => s.as_str(),
                Value::Object(obj) => obj.get("text").and_then(Value::as_str).unwrap_or(""),
                _ => "",
            })
            .collect::<String>(),
        _ => String::new(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn parse_date(message: &ExportMessage) -> Result<DateTime<Utc>, SourceError> {
    if let Some(ts) = message
        .date_unixtime
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
    {
        if let Some(dt) = DateTime::from_timestamp(ts, 0) {
            return Ok(dt);
        }
    }
    let raw = message
        .date
        .as_deref()
        .ok_or_else(|| SourceError::Malformed(format!("message {} has no date", message.id)))?;
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| SourceError::Malformed(format!("message {} date '{}': {}", message.id, raw, e)))
}

#[async_trait]
impl MessageSource for ExportSource {
    fn name(&self) -> &str {
        "export"
    }

    async fn resolve(&self, channel: &str) -> Result<ChannelInfo, SourceError> {
        let export = self.read_export(channel).await?;
        Ok(ChannelInfo {
            username: channel.to_string(),
            title: export.name,
        })
    }

    async fn fetch_since(
        &self,
        channel: &ChannelInfo,
        min_id: i64,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>, SourceError> {
        let export = self.read_export(&channel.username).await?;

        let mut messages = Vec::new();
        for m in export.messages {
            if m.id <= min_id || m.kind.as_deref().is_some_and(|k| k != "message") {
                continue;
            }
            messages.push(RemoteMessage {
                id: m.id,
                date: parse_date(&m)?,
                text: flatten_text(&m.text),
                has_photo: m.photo.is_some(),
                views: m.views,
                forwards: m.forwards,
                media_ref: m.photo,
            });
        }

        // Oldest first, so a capped batch never skips over older messages.
        messages.sort_by_key(|m| m.id);
        messages.truncate(limit);
        Ok(messages)
    }

    async fn download_photo(
        &self,
        channel: &ChannelInfo,
        message: &RemoteMessage,
        dest: &Path,
    ) -> Result<(), SourceError> {
        let relative = message.media_ref.as_deref().ok_or_else(|| {
            SourceError::Malformed(format!("message {} has no photo reference", message.id))
        })?;
        let src = self.channel_dir(&channel.username).join(relative);
        let bytes = tokio::fs::read(&src).await?;
        write_atomic(dest, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_export(root: &Path, slug: &str, json: &str) {
        let dir = root.join(slug);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("result.json"), json).unwrap();
    }

    #[test]
    fn test_flatten_text_entities() {
        let v: Value = serde_json::json!(["Buy ", {"type": "bold", "text": "now"}, "!"]);
        assert_eq!(flatten_text(&v).as_deref(), Some("Buy now!"));
        assert_eq!(flatten_text(&Value::String(String::new())), None);
    }

    #[tokio::test]
    async fn test_fetch_since_filters_sorts_and_caps() {
        let tmp = TempDir::new().unwrap();
        write_export(
            tmp.path(),
            "demo",
            r#"{"name": "Demo", "messages": [
                {"id": 9, "type": "message", "date": "2024-01-03T00:00:00", "text": "c"},
                {"id": 3, "type": "message", "date": "2024-01-01T00:00:00", "text": "a"},
                {"id": 4, "type": "service", "date": "2024-01-01T00:00:00", "text": ""},
                {"id": 7, "type": "message", "date_unixtime": "1704153600", "text": "b", "photo": "photos/7.jpg"}
            ]}"#,
        );
        let source = ExportSource::new(tmp.path());
        let channel = source.resolve("@demo").await.unwrap();
        assert_eq!(channel.title.as_deref(), Some("Demo"));

        let msgs = source.fetch_since(&channel, 3, 10).await.unwrap();
        let ids: Vec<i64> = msgs.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![7, 9]);
        assert!(msgs[0].has_photo);

        let capped = source.fetch_since(&channel, 0, 2).await.unwrap();
        let ids: Vec<i64> = capped.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 7]);
    }

    #[tokio::test]
    async fn test_download_photo_replaces_truncated_file() {
        let tmp = TempDir::new().unwrap();
        write_export(
            tmp.path(),
            "demo",
            r#"{"messages": [
                {"id": 2, "type": "message", "date": "2024-01-01T00:00:00", "text": "x", "photo": "photos/photo_2.jpg"}
            ]}"#,
        );
        std::fs::create_dir_all(tmp.path().join("demo/photos")).unwrap();
        std::fs::write(tmp.path().join("demo/photos/photo_2.jpg"), b"\xff\xd8full image").unwrap();

        let source = ExportSource::new(tmp.path());
        let channel = source.resolve("@demo").await.unwrap();
        let msgs = source.fetch_since(&channel, 0, 10).await.unwrap();

        // Left behind by an interrupted earlier run.
        let dest = tmp.path().join("images/demo/2.jpg");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"\xff").unwrap();

        source.download_photo(&channel, &msgs[0], &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"\xff\xd8full image");
        assert!(!tmp.path().join("images/demo/2.jpg.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_channel_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let source = ExportSource::new(tmp.path());
        assert!(matches!(
            source.resolve("@ghost").await,
            Err(SourceError::NotFound(_))
        ));
    }
}
