//! Remote messaging source abstraction.
//!
//! The fetcher talks to a channel history provider through the
//! [`MessageSource`] trait. Two implementations ship with the crate:
//!
//! | Source | Module | Credentials |
//! |--------|--------|-------------|
//! | MTProto HTTP bridge | [`crate::source_http`] | `TG_API_ID`, `TG_API_HASH`, `TG_PHONE` |
//! | Telegram Desktop export | [`crate::source_export`] | none |
//!
//! Sources report throttling through [`SourceError::FloodWait`], which the
//! fetcher turns into a bounded sleep-and-retry instead of a failure.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::{Config, Credentials};
use crate::source_export::ExportSource;
use crate::source_http::HttpSource;

/// A channel as resolved by the remote source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    /// The identifier the channel was requested by (e.g. `@tikvahpharma`).
    pub username: String,
    /// Human readable title, if the source reports one.
    pub title: Option<String>,
}

/// A message as returned by the remote source, before its photo is
/// downloaded.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessage {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub text: Option<String>,
    pub has_photo: bool,
    pub views: Option<u64>,
    pub forwards: Option<u64>,
    /// Source-specific handle for the attached photo, if the source needs
    /// one to download it later.
    pub media_ref: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// The source asked us to slow down for this many seconds.
    #[error("rate limited, retry after {seconds}s")]
    FloodWait { seconds: u64 },
    #[error("channel not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SourceError::Malformed(e.to_string())
        } else {
            SourceError::Transport(e.to_string())
        }
    }
}

/// A provider of channel message history.
///
/// Implementations must return messages strictly newer than `min_id`
/// according to the source's own id ordering; the fetcher still filters
/// and never assumes ids are contiguous.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Short name used in logs (e.g. `"http"`, `"export"`).
    fn name(&self) -> &str;

    /// Look up a channel by username.
    async fn resolve(&self, channel: &str) -> Result<ChannelInfo, SourceError>;

    /// The `limit` oldest messages with id greater than `min_id`, in
    /// ascending id order.
    ///
    /// The fetcher advances the checkpoint to the highest id returned, so a
    /// source that pages newest-first must ask its upstream for ascending
    /// order. Returning the newest `limit` instead would move the
    /// checkpoint past messages that were never fetched. A full batch that
    /// is not ascending is rejected by the fetcher.
    async fn fetch_since(
        &self,
        channel: &ChannelInfo,
        min_id: i64,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>, SourceError>;

    /// Write the photo attached to `message` to `dest`.
    async fn download_photo(
        &self,
        channel: &ChannelInfo,
        message: &RemoteMessage,
        dest: &Path,
    ) -> Result<(), SourceError>;
}

/// Build the source selected by `[scrape].source`.
///
/// The HTTP source needs credentials from the environment; this is the only
/// place the pipeline requires them.
pub fn create_source(config: &Config) -> Result<Arc<dyn MessageSource>> {
    match config.scrape.source.as_str() {
        "http" => {
            let credentials = Credentials::from_env()?;
            Ok(Arc::new(HttpSource::new(&config.source.http, credentials)?))
        }
        "export" => {
            let export = config
                .source
                .export
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[source.export] not configured"))?;
            Ok(Arc::new(ExportSource::new(&export.root)))
        }
        other => anyhow::bail!("Unknown scrape source: {}", other),
    }
}
