//! The latest-per-user store.
//!
//! `LatestByKeyStore` keeps one [`FilteredRecord`] per `user_id`: the one with
//! the newest `created_at`. The map is loaded from its JSON backing file when
//! the store is opened and the whole file is rewritten (temp file + rename)
//! after every change, or every `persist_every` changes with a final flush.
//!
//! The file is a pretty-printed JSON array ordered newest first, so it can be
//! served as-is to whatever displays the messages.
//!
//! Loading applies the same rules as merging. Entries without a `user_id` or
//! with an empty message are discarded, and when the file holds several
//! entries for one user the newest `created_at` wins (the earlier entry on a
//! tie). Discarded entries are gone from the file after the next save.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::fs_util;
use crate::record::FilteredRecord;
use crate::text::{epoch_sentinel, parse_created_at, try_parse_created_at};

/// What a merge did to the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The user had no entry yet.
    Inserted,
    /// The incoming record was newer and replaced the stored one.
    Replaced,
    /// The stored record was at least as new; nothing changed.
    KeptExisting,
    /// The message was empty; the record was ignored.
    SkippedEmpty,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::Replaced)
    }
}

struct Entry {
    /// First-insertion order, used to break timestamp ties when saving.
    seq: u64,
    record: FilteredRecord,
}

#[derive(Default)]
struct LatestMap {
    entries: HashMap<String, Entry>,
    next_seq: u64,
    unsaved_changes: usize,
}

impl LatestMap {
    fn merge(&mut self, record: FilteredRecord) -> MergeOutcome {
        if record.blessing_message.trim().is_empty() {
            return MergeOutcome::SkippedEmpty;
        }
        match self.entries.get_mut(&record.user_id) {
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.entries
                    .insert(record.user_id.clone(), Entry { seq, record });
                MergeOutcome::Inserted
            }
            Some(existing) => {
                let stored = parse_created_at(&existing.record.created_at);
                let incoming = parse_created_at(&record.created_at);
                if incoming > stored {
                    existing.record = record;
                    MergeOutcome::Replaced
                } else {
                    MergeOutcome::KeptExisting
                }
            }
        }
    }

    /// Entries ordered by `created_at` descending, ties in insertion order.
    fn ordered(&self) -> Vec<&FilteredRecord> {
        let mut keyed: Vec<(NaiveDateTime, u64, &FilteredRecord)> = self
            .entries
            .values()
            .map(|e| {
                let ts = try_parse_created_at(&e.record.created_at)
                    .unwrap_or_else(epoch_sentinel);
                (ts, e.seq, &e.record)
            })
            .collect();
        keyed.sort_by(|a, b| match b.0.cmp(&a.0) {
            Ordering::Equal => a.1.cmp(&b.1),
            other => other,
        });
        keyed.into_iter().map(|(_, _, r)| r).collect()
    }
}

pub struct LatestByKeyStore {
    path: PathBuf,
    persist_every: usize,
    map: Mutex<LatestMap>,
}

impl LatestByKeyStore {
    /// Opens the store, loading `path` if it exists.
    ///
    /// A missing file yields an empty store. A file that is not a JSON array
    /// of records is an error; individual entries without a `user_id` are
    /// skipped.
    pub async fn open(path: impl AsRef<Path>, persist_every: usize) -> Result<Self, PipelineError> {
        let path = path.as_ref().to_path_buf();
        let read_path = path.clone();
        let raw = tokio::task::spawn_blocking(move || match std::fs::read(&read_path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
        .await
        .map_err(|e| PipelineError::Other(format!("spawn_blocking failed: {}", e)))??;

        let mut map = LatestMap::default();
        if let Some(bytes) = raw {
            let stored: Vec<FilteredRecord> = serde_json::from_slice(&bytes).map_err(|e| {
                PipelineError::CorruptStore {
                    path: path.clone(),
                    source: e,
                }
            })?;
            for record in stored {
                if record.user_id.trim().is_empty() {
                    warn!("Skipping stored entry without user_id in {:?}", path);
                    continue;
                }
                let user_id = record.user_id.clone();
                match map.merge(record) {
                    MergeOutcome::SkippedEmpty => {
                        debug!("Discarding stored entry for user {}: empty message", user_id);
                    }
                    MergeOutcome::KeptExisting => {
                        debug!("Discarding older stored entry for user {}", user_id);
                    }
                    MergeOutcome::Inserted | MergeOutcome::Replaced => {}
                }
            }
        }
        map.unsaved_changes = 0;

        info!(
            "Opened latest-per-user store {:?} with {} entries",
            path,
            map.entries.len()
        );
        Ok(LatestByKeyStore {
            path,
            persist_every: persist_every.max(1),
            map: Mutex::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merges one record, persisting the map if it changed.
    pub async fn merge(&self, record: FilteredRecord) -> Result<MergeOutcome, PipelineError> {
        let mut map = self.map.lock().await;
        let user_id = record.user_id.clone();
        let outcome = map.merge(record);
        debug!("Merged record for user {}: {:?}", user_id, outcome);

        if outcome.changed() {
            map.unsaved_changes += 1;
            if map.unsaved_changes >= self.persist_every {
                self.persist(&mut map).await?;
            }
        }
        Ok(outcome)
    }

    /// Writes any unsaved changes to the backing file.
    pub async fn flush(&self) -> Result<(), PipelineError> {
        let mut map = self.map.lock().await;
        if map.unsaved_changes > 0 {
            self.persist(&mut map).await?;
        }
        Ok(())
    }

    /// The current entries in file order (newest first).
    pub async fn snapshot(&self) -> Vec<FilteredRecord> {
        let map = self.map.lock().await;
        map.ordered().into_iter().cloned().collect()
    }

    pub async fn get(&self, user_id: &str) -> Option<FilteredRecord> {
        let map = self.map.lock().await;
        map.entries.get(user_id).map(|e| e.record.clone())
    }

    pub async fn len(&self) -> usize {
        self.map.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self, map: &mut LatestMap) -> Result<(), PipelineError> {
        let json = serde_json::to_vec_pretty(&map.ordered())?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || fs_util::write_atomic(&path, &json))
            .await
            .map_err(|e| PipelineError::Other(format!("spawn_blocking failed: {}", e)))??;
        debug!(
            "Persisted {} entries to {:?}",
            map.entries.len(),
            self.path
        );
        map.unsaved_changes = 0;
        Ok(())
    }
}
