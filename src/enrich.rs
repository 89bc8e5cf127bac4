//! Label enrichment: run the detector over every downloaded photo and write
//! the detection CSV.
//!
//! Photos live at `<images>/<channel>/<message_id>.<ext>`; both keys are
//! recovered from the path. The CSV is rewritten from scratch on each run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::detector::{classify, create_detector, Detector};
use crate::fsio::write_atomic;
use crate::models::DetectionRow;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichStats {
    pub images: usize,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// `(channel, message_id)` for a photo path shaped `.../<channel>/<id>.<ext>`.
pub fn parse_image_path(path: &Path) -> Option<(String, i64)> {
    let message_id = path.file_stem()?.to_str()?.parse::<i64>().ok()?;
    let channel = path.parent()?.file_name()?.to_str()?;
    if channel.is_empty() {
        return None;
    }
    Some((channel.trim_start_matches('@').to_string(), message_id))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Image files under `root` matching the include globs, sorted.
pub fn scan_images(root: &Path, include_globs: &[String]) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let include_set = build_globset(include_globs)?;

    let mut images = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_lowercase();
        if include_set.is_match(&rel_str) {
            images.push(path.to_path_buf());
        }
    }
    images.sort();
    Ok(images)
}

/// Run `detector` over every image under `images_root` and write the CSV to
/// `output`.
pub async fn enrich_images(
    detector: &dyn Detector,
    images_root: &Path,
    include_globs: &[String],
    output: &Path,
) -> Result<EnrichStats> {
    let images = scan_images(images_root, include_globs)?;
    let mut stats = EnrichStats {
        images: images.len(),
        ..Default::default()
    };

    info!(images = images.len(), detector = detector.name(), "starting enrichment");

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    // Header even when there are no rows, so the loader sees a valid file.
    writer.write_record([
        "image_path",
        "channel_name",
        "message_id",
        "detected_objects",
        "confidence_scores",
        "classification",
    ])?;

    for path in &images {
        let Some((channel, message_id)) = parse_image_path(path) else {
            warn!(file = %path.display(), "could not parse image path");
            stats.skipped += 1;
            continue;
        };

        let detections = match detector.detect(path).await {
            Ok(d) => d,
            Err(e) => {
                error!(file = %path.display(), error = %e, "detection failed");
                stats.failed += 1;
                continue;
            }
        };

        let row = DetectionRow {
            image_path: path.to_string_lossy().to_string(),
            channel_name: channel,
            message_id,
            detected_objects: detections
                .iter()
                .map(|d| d.name.as_str())
                .collect::<Vec<_>>()
                .join("|"),
            confidence_scores: detections
                .iter()
                .map(|d| format!("{:.2}", d.confidence))
                .collect::<Vec<_>>()
                .join("|"),
            classification: classify(&detections).to_string(),
        };
        writer.serialize(&row)?;
        stats.written += 1;

        if stats.written % 10 == 0 {
            info!(processed = stats.written, "enrichment progress");
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to finish detection CSV: {}", e))?;
    write_atomic(output, &bytes)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(
        written = stats.written,
        failed = stats.failed,
        output = %output.display(),
        "enrichment complete"
    );
    Ok(stats)
}

/// CLI / pipeline entry point for the enrichment stage.
pub async fn run_enrich(config: &Config) -> Result<EnrichStats> {
    let detector = create_detector(&config.enrich)?;
    let stats = enrich_images(
        detector.as_ref(),
        &config.storage.images,
        &config.enrich.include_globs,
        &config.storage.detections_csv,
    )
    .await?;

    println!(
        "enrich: {} images, {} rows written, {} skipped, {} failed -> {}",
        stats.images,
        stats.written,
        stats.skipped,
        stats.failed,
        config.storage.detections_csv.display()
    );
    Ok(stats)
}
