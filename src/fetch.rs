//! Incremental channel scraping.
//!
//! Each channel is fetched by its own task, resuming from its checkpoint:
//!
//! ```text
//! Idle ──▶ Fetching ──▶ Landed
//!             │  ▲
//!             ▼  │
//!         RateLimited        (sleep exactly the requested seconds)
//!             │
//!             └──────▶ Failed (wait budget exhausted, or any other error)
//! ```
//!
//! Ordering guarantee: a channel's checkpoint only moves after its batch has
//! been durably written by the [`LandingWriter`]. A crash anywhere before
//! that point leaves the checkpoint at its previous value, so the next run
//! re-requests the same messages; the warehouse loader's duplicate skip makes
//! that harmless.
//!
//! Photo download failures do not fail the message: the record is landed
//! with `image_path = null` (and `has_media = true`), and a warning is logged.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{ChannelCheckpoint, CheckpointStore};
use crate::config::Config;
use crate::landing::LandingWriter;
use crate::models::{channel_key, channel_slug, RawMessageRecord};
use crate::source::{create_source, ChannelInfo, MessageSource, RemoteMessage, SourceError};

/// Lifecycle of one channel within a scrape run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Fetching,
    RateLimited,
    Landed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Maximum messages requested per channel per run.
    pub limit: usize,
    /// Rate-limit waits tolerated per channel before giving up.
    pub max_flood_waits: u32,
    /// Root directory for downloaded photos.
    pub images_root: PathBuf,
}

impl FetchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limit: config.scrape.limit,
            max_flood_waits: config.scrape.max_flood_waits,
            images_root: config.storage.images.clone(),
        }
    }
}

/// Records pulled for one channel, not yet landed.
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    /// Ordered by message id, all strictly greater than the checkpoint.
    pub records: Vec<RawMessageRecord>,
    /// Highest message id in `records`.
    pub max_id: Option<i64>,
}

/// Result of running one channel to a terminal state.
#[derive(Debug, Clone)]
pub struct ChannelOutcome {
    pub channel: String,
    pub state: ChannelState,
    /// Every state the channel passed through, starting with `Idle`.
    pub transitions: Vec<ChannelState>,
    pub fetched: usize,
    pub landed_file: Option<PathBuf>,
    pub checkpoint_before: i64,
    pub checkpoint_after: i64,
    pub error: Option<String>,
}

/// Outcome of a whole scrape run, one entry per requested channel.
#[derive(Debug, Clone, Default)]
pub struct ScrapeSummary {
    pub outcomes: Vec<ChannelOutcome>,
}

impl ScrapeSummary {
    pub fn landed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == ChannelState::Landed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == ChannelState::Failed)
            .count()
    }

    pub fn messages(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == ChannelState::Landed)
            .map(|o| o.fetched)
            .sum()
    }
}

/// Tracks one channel's state machine and its rate-limit budget.
struct ChannelRun {
    channel: String,
    state: ChannelState,
    transitions: Vec<ChannelState>,
    flood_waits: u32,
}

impl ChannelRun {
    fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            state: ChannelState::Idle,
            transitions: vec![ChannelState::Idle],
            flood_waits: 0,
        }
    }

    fn enter(&mut self, next: ChannelState) {
        debug!(channel = %self.channel, from = ?self.state, to = ?next, "channel state");
        self.state = next;
        self.transitions.push(next);
    }
}

pub struct ChannelFetcher {
    source: Arc<dyn MessageSource>,
    landing: LandingWriter,
    settings: FetchSettings,
}

impl ChannelFetcher {
    pub fn new(source: Arc<dyn MessageSource>, landing: LandingWriter, settings: FetchSettings) -> Self {
        Self {
            source,
            landing,
            settings,
        }
    }

    /// Deterministic on-disk location of a message's photo.
    pub fn image_path(&self, channel: &str, message_id: i64) -> PathBuf {
        self.settings
            .images_root
            .join(channel_slug(channel))
            .join(format!("{}.jpg", message_id))
    }

    /// Run `op`, sleeping and retrying whenever the source asks us to slow
    /// down, until it succeeds, fails otherwise, or the channel's wait budget
    /// is spent.
    async fn with_flood_wait<T, F, Fut>(&self, run: &mut ChannelRun, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        loop {
            match op().await {
                Err(SourceError::FloodWait { seconds })
                    if run.flood_waits < self.settings.max_flood_waits =>
                {
                    run.flood_waits += 1;
                    run.enter(ChannelState::RateLimited);
                    warn!(
                        channel = %run.channel,
                        seconds,
                        attempt = run.flood_waits,
                        "rate limited, waiting"
                    );
                    tokio::time::sleep(Duration::from_secs(seconds)).await;
                    run.enter(ChannelState::Fetching);
                }
                other => return other,
            }
        }
    }

    /// Pull every message newer than `offset`, downloading attached photos.
    ///
    /// Nothing is persisted here except photo files.
    async fn fetch_new(&self, run: &mut ChannelRun, offset: i64) -> Result<FetchedBatch> {
        let channel = run.channel.clone();

        let info = self
            .with_flood_wait(run, || self.source.resolve(&channel))
            .await?;

        let limit = self.settings.limit;
        let mut messages = self
            .with_flood_wait(run, || self.source.fetch_since(&info, offset, limit))
            .await?;

        // A full batch out of ascending order is what a newest-first page
        // looks like. Its maximum id would move the checkpoint past the
        // older messages it left out, so nothing from it is landed.
        if messages.len() >= limit && !messages.windows(2).all(|w| w[0].id <= w[1].id) {
            return Err(SourceError::Malformed(format!(
                "source returned a full batch of {} messages out of ascending id order",
                messages.len()
            ))
            .into());
        }

        // The source's id is the ordering key; anything at or below the
        // checkpoint was already landed.
        messages.retain(|m| m.id > offset);
        messages.sort_by_key(|m| m.id);
        messages.dedup_by_key(|m| m.id);
        messages.truncate(limit);

        let mut records = Vec::with_capacity(messages.len());
        let mut max_id: Option<i64> = None;

        for message in &messages {
            let image_path = if message.has_photo {
                self.download_photo(run, &info, message).await
            } else {
                None
            };

            records.push(RawMessageRecord {
                message_id: message.id,
                channel_name: channel.clone(),
                message_date: message.date,
                message_text: message.text.clone(),
                has_media: message.has_photo,
                image_path,
                views: message.views.unwrap_or(0),
                forwards: message.forwards.unwrap_or(0),
            });

            max_id = Some(max_id.map_or(message.id, |m| m.max(message.id)));
        }

        Ok(FetchedBatch { records, max_id })
    }

    async fn download_photo(
        &self,
        run: &mut ChannelRun,
        info: &ChannelInfo,
        message: &RemoteMessage,
    ) -> Option<String> {
        let dest = self.image_path(&run.channel, message.id);
        let result = self
            .with_flood_wait(run, || self.source.download_photo(info, message, &dest))
            .await;

        match result {
            Ok(()) => Some(dest.to_string_lossy().to_string()),
            Err(e) => {
                warn!(
                    channel = %run.channel,
                    message_id = message.id,
                    error = %e,
                    "photo download failed, keeping message without image"
                );
                remove_partial(&dest);
                None
            }
        }
    }

    /// Drive one channel from `Idle` to a terminal state: fetch, land, and
    /// only then advance the checkpoint.
    pub async fn run_channel(&self, mut checkpoint: ChannelCheckpoint, day: NaiveDate) -> ChannelOutcome {
        let mut run = ChannelRun::new(checkpoint.channel());
        let before = checkpoint.value();

        info!(channel = %run.channel, checkpoint = before, source = self.source.name(), "starting scrape");
        run.enter(ChannelState::Fetching);

        let mut outcome = ChannelOutcome {
            channel: run.channel.clone(),
            state: ChannelState::Failed,
            transitions: Vec::new(),
            fetched: 0,
            landed_file: None,
            checkpoint_before: before,
            checkpoint_after: before,
            error: None,
        };

        let result: Result<()> = async {
            let batch = self.fetch_new(&mut run, before).await?;
            outcome.fetched = batch.records.len();

            let landed = self.landing.write_batch(&run.channel, day, &batch.records)?;

            if let (Some(path), Some(max_id)) = (&landed, batch.max_id) {
                checkpoint.advance(max_id)?;
                info!(
                    channel = %run.channel,
                    messages = batch.records.len(),
                    file = %path.display(),
                    checkpoint = checkpoint.value(),
                    "landed batch"
                );
            } else {
                info!(channel = %run.channel, "no new messages");
            }
            outcome.landed_file = landed;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => run.enter(ChannelState::Landed),
            Err(e) => {
                let message = format!("{:#}", e);
                error!(channel = %run.channel, error = %message, "scrape failed");
                outcome.error = Some(message);
                run.enter(ChannelState::Failed);
            }
        }

        outcome.state = run.state;
        outcome.transitions = run.transitions;
        outcome.checkpoint_after = checkpoint.value();
        outcome
    }
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(file = %path.display(), error = %e, "could not remove partial photo");
        }
    }
}

/// Map requested names onto one identifier per channel.
///
/// Names match case-insensitively with the `@` optional, and the first
/// spelling in `known` wins. Names not in `known` get a leading `@`.
/// Repeats of a channel already listed are dropped, as are empty names.
pub fn canonical_channels(requested: &[String], known: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut channels = Vec::new();
    for name in requested {
        let key = channel_key(name);
        if key.is_empty() || !seen.insert(key.clone()) {
            continue;
        }
        let canonical = known
            .iter()
            .find(|k| channel_key(k) == key)
            .cloned()
            .unwrap_or_else(|| format!("@{}", channel_slug(name.trim())));
        channels.push(canonical);
    }
    channels
}

/// Fetch every channel concurrently. A failure in one channel never stops
/// the others; it is reported in that channel's outcome.
///
/// Each task owns the checkpoint handle for its channel and nothing else.
pub async fn scrape_channels(
    fetcher: Arc<ChannelFetcher>,
    store: &CheckpointStore,
    channels: &[String],
    day: NaiveDate,
) -> ScrapeSummary {
    // An existing checkpoint fixes the spelling, so checkpoint keys, landing
    // files and warehouse rows all name the channel the same way.
    let known: Vec<String> = store.snapshot().into_keys().collect();
    let unique = canonical_channels(channels, &known);

    let mut handles = Vec::with_capacity(unique.len());
    let mut outcomes = Vec::with_capacity(unique.len());

    for channel in &unique {
        match store.claim(channel) {
            Ok(checkpoint) => {
                let fetcher = fetcher.clone();
                let handle = tokio::spawn(async move { fetcher.run_channel(checkpoint, day).await });
                handles.push((channel.clone(), store.get(channel), handle));
            }
            Err(e) => {
                error!(channel = %channel, error = %e, "could not claim checkpoint");
                outcomes.push(failed_outcome(channel, store.get(channel), e.to_string()));
            }
        }
    }

    for (channel, before, handle) in handles {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                error!(channel = %channel, error = %e, "scrape task aborted");
                outcomes.push(failed_outcome(&channel, before, e.to_string()));
            }
        }
    }

    ScrapeSummary { outcomes }
}

fn failed_outcome(channel: &str, checkpoint: i64, error: String) -> ChannelOutcome {
    ChannelOutcome {
        channel: channel.to_string(),
        state: ChannelState::Failed,
        transitions: vec![ChannelState::Idle, ChannelState::Failed],
        fetched: 0,
        landed_file: None,
        checkpoint_before: checkpoint,
        checkpoint_after: checkpoint,
        error: Some(error),
    }
}

/// CLI / pipeline entry point for the fetch stage.
pub async fn run_scrape(
    config: &Config,
    channels: Option<Vec<String>>,
    limit: Option<usize>,
) -> Result<ScrapeSummary> {
    let channels = match channels {
        Some(list) if !list.is_empty() => {
            if list.iter().any(|c| channel_key(c).is_empty()) {
                anyhow::bail!("--channel must name a channel");
            }
            canonical_channels(&list, &config.scrape.channels)
        }
        _ => config.scrape.channels.clone(),
    };

    let mut settings = FetchSettings::from_config(config);
    if let Some(l) = limit {
        if l == 0 {
            anyhow::bail!("--limit must be > 0");
        }
        settings.limit = l;
    }

    let source = create_source(config)?;
    let store = CheckpointStore::open(&config.storage.checkpoints)?;
    let fetcher = Arc::new(ChannelFetcher::new(
        source,
        LandingWriter::new(&config.storage.raw_messages),
        settings,
    ));

    let summary = scrape_channels(fetcher, &store, &channels, Utc::now().date_naive()).await;

    println!("scrape");
    for o in &summary.outcomes {
        match o.state {
            ChannelState::Landed => println!(
                "  {}: {} messages, checkpoint {} -> {}",
                o.channel, o.fetched, o.checkpoint_before, o.checkpoint_after
            ),
            _ => println!(
                "  {}: FAILED ({}), checkpoint {}",
                o.channel,
                o.error.as_deref().unwrap_or("unknown error"),
                o.checkpoint_after
            ),
        }
    }
    println!(
        "  channels landed: {}, failed: {}, messages: {}",
        summary.landed(),
        summary.failed(),
        summary.messages()
    );

    Ok(summary)
}
