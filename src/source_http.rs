//! HTTP bridge source.
//!
//! Talks to a small MTProto bridge service that holds the Telegram session
//! and exposes channel history as JSON:
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | `GET` | `/channels/{channel}` | `{"username": "...", "title": "..."}` |
//! | `GET` | `/channels/{channel}/messages?min_id=&limit=&reverse=true` | `{"messages": [...]}` |
//! | `GET` | `/channels/{channel}/messages/{id}/photo` | raw image bytes |
//!
//! History is always requested with `reverse=true`, so the bridge walks the
//! channel oldest-first from `min_id` (Telegram's default is newest-first).
//! Every request carries the API id, hash and phone number as headers.
//! HTTP 429 is mapped to [`SourceError::FloodWait`] using the `Retry-After`
//! header, or a `retry_after` field in the JSON body.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode, Url};
use serde::Deserialize;

use crate::config::{Credentials, HttpSourceConfig};
use crate::fsio::write_atomic;
use crate::source::{ChannelInfo, MessageSource, RemoteMessage, SourceError};

/// Seconds to wait when the bridge throttles without saying for how long.
const DEFAULT_FLOOD_WAIT_SECS: u64 = 1;

pub struct HttpSource {
    client: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
}

#[derive(Debug, Deserialize)]
struct ChannelBody {
    username: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesBody {
    messages: Vec<MessageBody>,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    id: i64,
    date: DateTime<Utc>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    has_photo: bool,
    #[serde(default)]
    views: Option<u64>,
    #[serde(default)]
    forwards: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ThrottleBody {
    retry_after: Option<u64>,
}

impl HttpSource {
    pub fn new(config: &HttpSourceConfig, credentials: Credentials) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| anyhow::anyhow!("invalid source.http.base_url '{}': {}", config.base_url, e))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("source.http.base_url must be an http(s) URL");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Transport("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<Response, SourceError> {
        let response = self
            .client
            .get(url)
            .header("X-Api-Id", &self.credentials.api_id)
            .header("X-Api-Hash", &self.credentials.api_hash)
            .header("X-Phone", &self.credentials.phone)
            .send()
            .await?;
        check_status(response).await
    }
}

/// Map non-success statuses to typed errors, passing successful responses through.
async fn check_status(response: Response) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let header_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let seconds = match header_secs {
                Some(s) => s,
                None => response
                    .json::<ThrottleBody>()
                    .await
                    .ok()
                    .and_then(|b| b.retry_after)
                    .unwrap_or(DEFAULT_FLOOD_WAIT_SECS),
            };
            Err(SourceError::FloodWait { seconds })
        }
        StatusCode::NOT_FOUND => {
            let path = response.url().path().to_string();
            Err(SourceError::NotFound(path))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            let body = response.text().await.unwrap_or_default();
            Err(SourceError::Unauthorized(format!("{}: {}", status, body)))
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(SourceError::Transport(format!("{}: {}", status, body)))
        }
    }
}

#[async_trait]
impl MessageSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn resolve(&self, channel: &str) -> Result<ChannelInfo, SourceError> {
        let url = self.url(&["channels", channel])?;
        let body: ChannelBody = self.get(url).await?.json().await?;
        Ok(ChannelInfo {
            username: body.username.unwrap_or_else(|| channel.to_string()),
            title: body.title,
        })
    }

    async fn fetch_since(
        &self,
        channel: &ChannelInfo,
        min_id: i64,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>, SourceError> {
        let mut url = self.url(&["channels", &channel.username, "messages"])?;
        url.query_pairs_mut()
            .append_pair("min_id", &min_id.to_string())
            .append_pair("limit", &limit.to_string())
            .append_pair("reverse", "true");

        let body: MessagesBody = self.get(url).await?.json().await?;
        Ok(body
            .messages
            .into_iter()
            .map(|m| RemoteMessage {
                id: m.id,
                date: m.date,
                text: m.text,
                has_photo: m.has_photo,
                views: m.views,
                forwards: m.forwards,
                media_ref: None,
            })
            .collect())
    }

    async fn download_photo(
        &self,
        channel: &ChannelInfo,
        message: &RemoteMessage,
        dest: &Path,
    ) -> Result<(), SourceError> {
        let id = message.id.to_string();
        let url = self.url(&["channels", &channel.username, "messages", &id, "photo"])?;
        let bytes = self.get(url).await?.bytes().await?;
        write_atomic(dest, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(base: &str) -> HttpSource {
        HttpSource::new(
            &HttpSourceConfig {
                base_url: base.to_string(),
                timeout_secs: 5,
            },
            Credentials {
                api_id: "1".into(),
                api_hash: "h".into(),
                phone: "+100".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_url_building_keeps_base_path() {
        let src = source("http://bridge.local/api/");
        let url = src.url(&["channels", "@demo", "messages"]).unwrap();
        assert_eq!(url.as_str(), "http://bridge.local/api/channels/@demo/messages");
    }

    #[test]
    fn test_rejects_non_base_url() {
        let result = HttpSource::new(
            &HttpSourceConfig {
                base_url: "mailto:someone@example.com".to_string(),
                timeout_secs: 5,
            },
            Credentials {
                api_id: "1".into(),
                api_hash: "h".into(),
                phone: "+100".into(),
            },
        );
        assert!(result.is_err());
    }
}
