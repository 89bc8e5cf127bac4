//! Object detectors and the image classification policy.
//!
//! The model itself is a black box behind [`Detector`]. Two backends:
//!
//! - [`PlaceholderDetector`] derives a stable pseudo-result from a SHA-256 of
//!   the image path. It needs no model and is what tests and offline runs use.
//! - [`HttpDetector`] posts the image bytes to an inference service that
//!   answers `{"detections": [{"name": "person", "confidence": 0.91}]}`.
//!   Throttling and server errors are retried with exponential backoff.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::EnrichConfig;
use crate::models::{Detection, ImageCategory};

const PERSON_LABELS: &[&str] = &["person"];

/// Labels standing in for medical and cosmetic products.
const PRODUCT_LABELS: &[&str] = &[
    "bottle", "cup", "bowl", "vase", "suitcase", "handbag", "backpack",
];

const MAX_RETRIES: u32 = 3;

#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    /// Objects found in the image at `path`.
    async fn detect(&self, path: &Path) -> Result<Vec<Detection>>;
}

/// Map detected object names to an image category.
///
/// | person-like | product-like | category |
/// |---|---|---|
/// | yes | yes | Promotional |
/// | no | yes | Product Display |
/// | yes | no | Lifestyle |
/// | no | no | Other |
pub fn classify(detections: &[Detection]) -> ImageCategory {
    let has_person = detections
        .iter()
        .any(|d| PERSON_LABELS.contains(&d.name.as_str()));
    let has_product = detections
        .iter()
        .any(|d| PRODUCT_LABELS.contains(&d.name.as_str()));

    match (has_person, has_product) {
        (true, true) => ImageCategory::Promotional,
        (false, true) => ImageCategory::ProductDisplay,
        (true, false) => ImageCategory::Lifestyle,
        (false, false) => ImageCategory::Other,
    }
}

pub struct PlaceholderDetector;

#[async_trait]
impl Detector for PlaceholderDetector {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn detect(&self, path: &Path) -> Result<Vec<Detection>> {
        let digest = Sha256::digest(path.to_string_lossy().as_bytes());
        let confidence = |b: u8| 0.50 + (b as f64 / 255.0) * 0.49;

        let names: &[&str] = match digest[0] % 4 {
            0 => &["person", "bottle"],
            1 => &["bottle"],
            2 => &["person"],
            _ => &[],
        };

        Ok(names
            .iter()
            .enumerate()
            .map(|(i, name)| Detection {
                name: name.to_string(),
                confidence: confidence(digest[i + 1]),
            })
            .collect())
    }
}

pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

impl HttpDetector {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    fn name(&self) -> &str {
        "http"
    }

    async fn detect(&self, path: &Path) -> Result<Vec<Detection>> {
        let bytes = tokio::fs::read(path).await?;
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .header("Content-Type", "application/octet-stream")
                .body(bytes.clone())
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: DetectResponse = response.json().await?;
                        return Ok(body.detections);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("detector error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("detector error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("detection failed after retries")))
    }
}

/// Build the detector selected by `[enrich].detector`.
pub fn create_detector(config: &EnrichConfig) -> Result<Box<dyn Detector>> {
    match config.detector.as_str() {
        "placeholder" => Ok(Box::new(PlaceholderDetector)),
        "http" => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("enrich.endpoint required for the http detector"))?;
            Ok(Box::new(HttpDetector::new(endpoint, config.timeout_secs)?))
        }
        other => bail!("Unknown detector: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dets(names: &[&str]) -> Vec<Detection> {
        names
            .iter()
            .map(|n| Detection {
                name: n.to_string(),
                confidence: 0.9,
            })
            .collect()
    }

    #[test]
    fn test_classification_table() {
        assert_eq!(classify(&dets(&["person", "bottle"])), ImageCategory::Promotional);
        assert_eq!(classify(&dets(&["cup", "handbag"])), ImageCategory::ProductDisplay);
        assert_eq!(classify(&dets(&["person"])), ImageCategory::Lifestyle);
        assert_eq!(classify(&dets(&["car", "dog"])), ImageCategory::Other);
        assert_eq!(classify(&[]), ImageCategory::Other);
    }

    #[tokio::test]
    async fn test_placeholder_is_deterministic() {
        let d = PlaceholderDetector;
        let path = Path::new("data/raw/images/demo/42.jpg");
        let a = d.detect(path).await.unwrap();
        let b = d.detect(path).await.unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|x| (0.5..=0.99).contains(&x.confidence)));
    }

    #[test]
    fn test_http_detector_requires_endpoint() {
        let config = EnrichConfig {
            detector: "http".into(),
            ..EnrichConfig::default()
        };
        assert!(create_detector(&config).is_err());
    }
}
