use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::channel_key;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub enrich: EnrichConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScrapeConfig {
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
    /// Maximum number of messages requested per channel per run.
    #[serde(default = "default_scrape_limit")]
    pub limit: usize,
    /// Remote source kind: `http` or `export`.
    #[serde(default = "default_source_kind")]
    pub source: String,
    /// How many rate-limit waits a single channel may sit through before it
    /// is marked failed for the run.
    #[serde(default = "default_max_flood_waits")]
    pub max_flood_waits: u32,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            limit: default_scrape_limit(),
            source: default_source_kind(),
            max_flood_waits: default_max_flood_waits(),
        }
    }
}

fn default_channels() -> Vec<String> {
    vec![
        "@lobelia4cosmetics".to_string(),
        "@tikvahpharma".to_string(),
        "@CheMed123".to_string(),
    ]
}
fn default_scrape_limit() -> usize {
    50
}
fn default_source_kind() -> String {
    "http".to_string()
}
fn default_max_flood_waits() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourceConfig {
    #[serde(default)]
    pub http: HttpSourceConfig,
    pub export: Option<ExportSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpSourceConfig {
    #[serde(default = "default_bridge_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_bridge_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:8081".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportSourceConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_raw_messages")]
    pub raw_messages: PathBuf,
    #[serde(default = "default_images")]
    pub images: PathBuf,
    #[serde(default = "default_checkpoints")]
    pub checkpoints: PathBuf,
    #[serde(default = "default_detections_csv")]
    pub detections_csv: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            raw_messages: default_raw_messages(),
            images: default_images(),
            checkpoints: default_checkpoints(),
            detections_csv: default_detections_csv(),
        }
    }
}

fn default_raw_messages() -> PathBuf {
    PathBuf::from("data/raw/telegram_messages")
}
fn default_images() -> PathBuf {
    PathBuf::from("data/raw/images")
}
fn default_checkpoints() -> PathBuf {
    PathBuf::from("logs/checkpoints.json")
}
fn default_detections_csv() -> PathBuf {
    PathBuf::from("data/processed/yolo_detections.csv")
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichConfig {
    /// Detector backend: `placeholder` or `http`.
    #[serde(default = "default_detector")]
    pub detector: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_image_globs")]
    pub include_globs: Vec<String>,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            detector: default_detector(),
            endpoint: None,
            timeout_secs: default_timeout_secs(),
            include_globs: default_image_globs(),
        }
    }
}

fn default_detector() -> String {
    "placeholder".to_string()
}
fn default_image_globs() -> Vec<String> {
    vec![
        "**/*.jpg".to_string(),
        "**/*.jpeg".to_string(),
        "**/*.png".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_top_limit")]
    pub default_top_limit: i64,
    #[serde(default = "default_max_search_results")]
    pub max_search_results: i64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            default_top_limit: default_top_limit(),
            max_search_results: default_max_search_results(),
        }
    }
}

fn default_top_limit() -> i64 {
    10
}
fn default_max_search_results() -> i64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

/// Credentials for the remote messaging source. Only the fetch step needs
/// them, so they are read from the environment on demand rather than being
/// part of [`Config`].
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_id: String,
    pub api_hash: String,
    pub phone: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        let read = |key: &str| -> Result<String> {
            match std::env::var(key) {
                Ok(v) if !v.trim().is_empty() => Ok(v),
                _ => bail!("{} environment variable not set", key),
            }
        };
        Ok(Self {
            api_id: read("TG_API_ID")?,
            api_hash: read("TG_API_HASH")?,
            phone: read("TG_PHONE")?,
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.scrape.limit == 0 {
        bail!("scrape.limit must be > 0");
    }

    let mut keys = std::collections::HashSet::new();
    for channel in &config.scrape.channels {
        let key = channel_key(channel);
        if key.is_empty() {
            bail!("scrape.channels contains an empty channel name");
        }
        if !keys.insert(key) {
            bail!(
                "scrape.channels lists '{}' more than once (names are case-insensitive, '@' optional)",
                channel
            );
        }
    }

    match config.scrape.source.as_str() {
        "http" => {}
        "export" => {
            if config.source.export.is_none() {
                bail!("scrape.source = \"export\" requires a [source.export] section");
            }
        }
        other => bail!("Unknown scrape source: '{}'. Must be http or export.", other),
    }

    match config.enrich.detector.as_str() {
        "placeholder" => {}
        "http" => {
            if config.enrich.endpoint.is_none() {
                bail!("enrich.endpoint must be specified when detector is 'http'");
            }
        }
        other => bail!(
            "Unknown detector: '{}'. Must be placeholder or http.",
            other
        ),
    }

    if config.api.default_top_limit < 1 {
        bail!("api.default_top_limit must be >= 1");
    }
    if config.api.max_search_results < 1 {
        bail!("api.max_search_results must be >= 1");
    }

    Ok(())
}
