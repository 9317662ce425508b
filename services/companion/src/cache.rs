//! Persistent lpath -> metadata cache.
//!
//! One JSON file per paired desktop (`calibre_cache_<deviceUuid>.json`).
//! It lets the desktop send bare lpaths for books it has seen: at booklist
//! time the cache re-attaches the uuid and last-modified stamp the desktop
//! assigned earlier.
//!
//! The file is read once per session and rewritten only on graceful
//! disconnect; load/save failures are non-fatal (the cache then runs
//! memory-only for the session).

use crate::timeutil;
use calibre_wire::{BookMetadata, CacheBookRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Entries unused for this many days are dropped at save time.
const PURGE_AFTER_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    book: CacheBookRecord,
    last_used: String,
}

#[derive(Default)]
pub struct MetadataCache {
    path: Option<PathBuf>,
    entries: BTreeMap<String, CacheEntry>,
}

impl MetadataCache {
    /// An uninitialized cache: memory-only until `initialize` binds a file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the cache to its per-device file and load it.
    ///
    /// A missing file starts fresh; an unreadable one is logged and
    /// overwritten at the next save. Entries are keyed by their book's
    /// lpath regardless of the key they were stored under.
    pub fn initialize(&mut self, data_dir: &Path, device_uuid: &str) {
        if device_uuid.is_empty() {
            warn!("no device uuid; cache stays memory-only");
            return;
        }
        let path = data_dir.join(format!("calibre_cache_{}.json", device_uuid));
        self.entries.clear();
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<BTreeMap<String, CacheEntry>>(&text) {
                Ok(loaded) => {
                    for (_, entry) in loaded {
                        if !entry.book.lpath.is_empty() {
                            self.entries.insert(entry.book.lpath.clone(), entry);
                        }
                    }
                    info!(entries = self.entries.len(), "metadata cache loaded");
                }
                Err(e) => warn!(error = %e, "cache file unreadable, starting fresh"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no cache file yet, starting fresh");
            }
            Err(e) => warn!(error = %e, "cache file unreadable, starting fresh"),
        }
        self.path = Some(path);
    }

    pub fn get(&self, lpath: &str) -> Option<&CacheBookRecord> {
        self.entries.get(lpath).map(|entry| &entry.book)
    }

    pub fn uuid_for(&self, lpath: &str) -> Option<&str> {
        self.get(lpath).map(|book| book.uuid.as_str())
    }

    /// Record `meta`, stamping `last_used` = now.  An empty incoming uuid
    /// does not clobber a previously-cached one.
    pub fn update(&mut self, meta: &BookMetadata) {
        if meta.lpath.is_empty() {
            return;
        }
        let mut book = meta.to_cache_record();
        if book.uuid.is_empty() {
            if let Some(prev) = self.entries.get(&meta.lpath) {
                book.uuid = prev.book.uuid.clone();
            }
        }
        self.entries.insert(
            meta.lpath.clone(),
            CacheEntry {
                book,
                last_used: timeutil::now_iso(),
            },
        );
    }

    pub fn remove(&mut self, lpath: &str) {
        self.entries.remove(lpath);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Purge stale entries, then rewrite the file atomically (temp file +
    /// rename).  A memory-only cache saves nothing and succeeds.
    pub fn save(&mut self) -> Result<(), CacheError> {
        self.purge_older_than(PURGE_AFTER_DAYS);
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(&self.entries)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        info!(entries = self.entries.len(), "metadata cache saved");
        Ok(())
    }

    fn purge_older_than(&mut self, days: i64) {
        let threshold = timeutil::now_epoch() - days * 24 * 60 * 60;
        self.entries
            .retain(|_, entry| match timeutil::parse_iso(&entry.last_used) {
                Some(ts) => ts >= threshold,
                // Unparseable stamps are kept; purging is best-effort.
                None => true,
            });
    }
}
