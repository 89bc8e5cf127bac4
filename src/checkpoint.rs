//! Per-channel resumption state.
//!
//! The store is a JSON object mapping channel identifier to the highest
//! message id already landed for that channel, e.g.
//!
//! ```json
//! {
//!   "@lobelia4cosmetics": 18213,
//!   "@tikvahpharma": 160742
//! }
//! ```
//!
//! Ownership is partitioned by key: [`CheckpointStore::claim`] hands out a
//! single [`ChannelCheckpoint`] per channel, and that handle is the only way
//! to move the channel's value. Values only ever increase, and every change
//! is persisted with an atomic file replace before `advance` returns.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::fsio::write_atomic;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint for channel '{0}' is already claimed")]
    AlreadyClaimed(String),
    #[error("failed to access checkpoint file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint file {path} is not a channel to message id map: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    values: BTreeMap<String, i64>,
    claimed: HashSet<String>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, values: &BTreeMap<String, i64>) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(values).map_err(|e| CheckpointError::Parse {
            path: self.path.clone(),
            source: e,
        })?;
        write_atomic(&self.path, &json).map_err(|e| CheckpointError::Io {
            path: self.path.clone(),
            source: e,
        })
    }
}

/// Durable channel → last-seen message id map.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    inner: Arc<Inner>,
}

impl CheckpointStore {
    /// Open the store at `path`. A missing file is an empty store; the file
    /// is created on the first advance.
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        let values = match std::fs::read(path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Parse {
                    path: path.to_path_buf(),
                    source: e,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(CheckpointError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        Ok(Self {
            inner: Arc::new(Inner {
                path: path.to_path_buf(),
                state: Mutex::new(State {
                    values,
                    claimed: HashSet::new(),
                }),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Current value for a channel, 0 if it has never been landed.
    pub fn get(&self, channel: &str) -> i64 {
        self.inner.lock().values.get(channel).copied().unwrap_or(0)
    }

    /// Copy of every channel's current value.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.inner.lock().values.clone()
    }

    /// Take exclusive ownership of one channel's checkpoint for the duration
    /// of a fetch. The claim is released when the handle is dropped.
    pub fn claim(&self, channel: &str) -> Result<ChannelCheckpoint, CheckpointError> {
        let mut state = self.inner.lock();
        if !state.claimed.insert(channel.to_string()) {
            return Err(CheckpointError::AlreadyClaimed(channel.to_string()));
        }
        let value = state.values.get(channel).copied().unwrap_or(0);
        Ok(ChannelCheckpoint {
            channel: channel.to_string(),
            value,
            store: self.inner.clone(),
        })
    }
}

/// Exclusive handle on a single channel's checkpoint.
#[derive(Debug)]
pub struct ChannelCheckpoint {
    channel: String,
    value: i64,
    store: Arc<Inner>,
}

impl ChannelCheckpoint {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The last durably committed value for this channel.
    pub fn value(&self) -> i64 {
        self.value
    }

    /// Move the checkpoint to `max(current, candidate)` and persist it.
    ///
    /// Returns `true` when the value changed. On a write failure the
    /// in-memory value is left at its previous, still-durable value.
    pub fn advance(&mut self, candidate: i64) -> Result<bool, CheckpointError> {
        if candidate <= self.value {
            return Ok(false);
        }

        let mut state = self.store.lock();
        let previous = state.values.insert(self.channel.clone(), candidate);
        if let Err(e) = self.store.persist(&state.values) {
            match previous {
                Some(old) => state.values.insert(self.channel.clone(), old),
                None => state.values.remove(&self.channel),
            };
            return Err(e);
        }
        drop(state);

        self.value = candidate;
        Ok(true)
    }
}

impl Drop for ChannelCheckpoint {
    fn drop(&mut self) {
        self.store.lock().claimed.remove(&self.channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(&tmp.path().join("checkpoints.json")).unwrap();
        assert!(store.snapshot().is_empty());
        assert_eq!(store.get("@test"), 0);
    }

    #[test]
    fn test_advance_persists_human_readable_map() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs/checkpoints.json");
        let store = CheckpointStore::open(&path).unwrap();

        let mut cp = store.claim("@test").unwrap();
        assert!(cp.advance(123).unwrap());
        drop(cp);

        let data: BTreeMap<String, i64> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(data.get("@test"), Some(&123));

        let reopened = CheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.get("@test"), 123);
    }

    #[test]
    fn test_advance_never_decreases() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(&tmp.path().join("cp.json")).unwrap();
        let mut cp = store.claim("@demo").unwrap();

        assert!(cp.advance(10).unwrap());
        assert!(!cp.advance(7).unwrap());
        assert!(!cp.advance(10).unwrap());
        assert_eq!(cp.value(), 10);
        assert_eq!(store.get("@demo"), 10);
    }

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(&tmp.path().join("cp.json")).unwrap();

        let first = store.claim("@demo").unwrap();
        assert!(matches!(
            store.claim("@demo"),
            Err(CheckpointError::AlreadyClaimed(_))
        ));
        let _other = store.claim("@other").unwrap();

        drop(first);
        assert!(store.claim("@demo").is_ok());
    }

    #[test]
    fn test_channels_are_independent() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(&tmp.path().join("cp.json")).unwrap();
        let mut a = store.claim("@a").unwrap();
        let mut b = store.claim("@b").unwrap();
        a.advance(5).unwrap();
        b.advance(900).unwrap();
        assert_eq!(store.get("@a"), 5);
        assert_eq!(store.get("@b"), 900);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cp.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            CheckpointStore::open(&path),
            Err(CheckpointError::Parse { .. })
        ));
    }
}
