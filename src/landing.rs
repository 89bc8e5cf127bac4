//! Landed batch files.
//!
//! Each fetch run writes one JSON array per channel per day:
//!
//! ```text
//! <raw_root>/2024-05-01/tikvahpharma.json
//! <raw_root>/2024-05-01/lobelia4cosmetics.json
//! <raw_root>/2024-05-02/tikvahpharma.json
//! ```
//!
//! Files are replaced atomically and never edited in place. A second run on
//! the same day supersedes the earlier file with one holding both batches,
//! so records that were landed but not yet loaded are never dropped.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::fsio::write_atomic;
use crate::models::{channel_slug, RawMessageRecord};

#[derive(Debug, Clone)]
pub struct LandingWriter {
    root: PathBuf,
}

impl LandingWriter {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Location of the batch file for `channel` on `day`.
    pub fn batch_path(&self, channel: &str, day: NaiveDate) -> PathBuf {
        self.root
            .join(day.format("%Y-%m-%d").to_string())
            .join(format!("{}.json", channel_slug(channel)))
    }

    /// Durably write a batch. Returns the file path, or `None` for an empty
    /// batch (nothing is written).
    ///
    /// When the day's file already exists its records are kept and only ids
    /// not already present are added. The result is ordered by message id.
    pub fn write_batch(
        &self,
        channel: &str,
        day: NaiveDate,
        records: &[RawMessageRecord],
    ) -> Result<Option<PathBuf>> {
        if records.is_empty() {
            return Ok(None);
        }

        let path = self.batch_path(channel, day);

        let mut merged: BTreeMap<i64, RawMessageRecord> = BTreeMap::new();
        if path.exists() {
            for rec in read_batch(&path)? {
                merged.insert(rec.message_id, rec);
            }
        }
        for rec in records {
            merged
                .entry(rec.message_id)
                .or_insert_with(|| rec.clone());
        }

        let batch: Vec<&RawMessageRecord> = merged.values().collect();
        let json = serde_json::to_vec_pretty(&batch)?;
        write_atomic(&path, &json)
            .with_context(|| format!("Failed to write landed batch {}", path.display()))?;

        Ok(Some(path))
    }
}

/// Read a landed batch file.
pub fn read_batch(path: &Path) -> Result<Vec<RawMessageRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read landed batch {}", path.display()))?;
    let records: Vec<RawMessageRecord> = serde_json::from_str(&content)
        .with_context(|| format!("Malformed landed batch {}", path.display()))?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn record(id: i64, views: u64) -> RawMessageRecord {
        RawMessageRecord {
            message_id: id,
            channel_name: "@demo".to_string(),
            message_date: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            message_text: Some(format!("post {}", id)),
            has_media: false,
            image_path: None,
            views,
            forwards: 0,
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn test_batch_path_layout() {
        let writer = LandingWriter::new(Path::new("raw"));
        assert_eq!(
            writer.batch_path("@demo", day()),
            PathBuf::from("raw/2024-05-01/demo.json")
        );
    }

    #[test]
    fn test_empty_batch_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let writer = LandingWriter::new(tmp.path());
        assert!(writer.write_batch("@demo", day(), &[]).unwrap().is_none());
        assert!(!writer.batch_path("@demo", day()).exists());
    }

    #[test]
    fn test_same_day_rerun_keeps_earlier_records() {
        let tmp = TempDir::new().unwrap();
        let writer = LandingWriter::new(tmp.path());

        writer
            .write_batch("@demo", day(), &[record(5, 1), record(6, 1)])
            .unwrap();
        let path = writer
            .write_batch("@demo", day(), &[record(6, 99), record(7, 1)])
            .unwrap()
            .unwrap();

        let landed = read_batch(&path).unwrap();
        let ids: Vec<i64> = landed.iter().map(|r| r.message_id).collect();
        assert_eq!(ids, vec![5, 6, 7]);
        // The first landed copy of a message wins.
        assert_eq!(landed[1].views, 1);
    }

    #[test]
    fn test_read_batch_rejects_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "[{\"message_id\": \"x\"}]").unwrap();
        assert!(read_batch(&path).is_err());
    }
}
