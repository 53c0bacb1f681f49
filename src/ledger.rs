#![forbid(unsafe_code)]

//! The persistent ledger: a single JSON document recording which URLs were
//! processed, what each one produced, and what failed.
//!
//! Every field defaults to empty when absent so older or hand-edited files
//! keep loading. The store never batches writes; callers save after each
//! mutation so an interrupted run resumes from the last processed item.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::FailureKind;
use crate::youtube::Resolution;

/// Group key used when a transcript batch is not tied to a channel.
pub const DEFAULT_GROUP: &str = "videos";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub title: String,
    pub transcript_text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    #[serde(default)]
    pub downloaded: u64,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDownload {
    pub url: String,
    pub error: String,
    #[serde(default = "unexpected_kind")]
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

fn unexpected_kind() -> FailureKind {
    FailureKind::Unexpected
}

/// Terminal NotFound/Disabled outcome. The URL counts as processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailableItem {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailEntry {
    pub url: String,
    pub quality: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoEntry {
    pub url: String,
    pub title: String,
    pub path: PathBuf,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// `group -> video_id -> transcript`.
    #[serde(default)]
    pub transcripts: BTreeMap<String, BTreeMap<String, TranscriptEntry>>,
    /// Every URL any batch has finished with, in processing order.
    #[serde(default)]
    pub downloaded_links: Vec<String>,
    /// `scope -> urls`, where a scope is one feature (and transcript group).
    /// Batches only skip URLs already processed in their own scope.
    #[serde(default)]
    pub processed_links: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub download_progress: DownloadProgress,
    #[serde(default)]
    pub failed_downloads: Vec<FailedDownload>,
    #[serde(default)]
    pub unavailable: Vec<UnavailableItem>,
    #[serde(default)]
    pub thumbnails: BTreeMap<String, ThumbnailEntry>,
    #[serde(default)]
    pub videos: BTreeMap<String, VideoEntry>,
}

impl LedgerRecord {
    pub fn has_link(&self, url: &str) -> bool {
        self.downloaded_links.iter().any(|link| link == url)
    }

    /// Appends `url` unless it is already recorded. Returns whether it was new.
    pub fn push_link(&mut self, url: &str) -> bool {
        if self.has_link(url) {
            return false;
        }
        self.downloaded_links.push(url.to_string());
        true
    }

    pub fn has_processed(&self, scope: &str, url: &str) -> bool {
        self.processed_links
            .get(scope)
            .is_some_and(|links| links.iter().any(|link| link == url))
    }

    /// Marks `url` done for `scope` and adds it to `downloaded_links`.
    pub fn mark_processed(&mut self, scope: &str, url: &str) {
        let links = self.processed_links.entry(scope.to_string()).or_default();
        if !links.iter().any(|link| link == url) {
            links.push(url.to_string());
        }
        self.push_link(url);
    }

    pub fn has_transcript(&self, group: &str, video_id: &str) -> bool {
        self.transcripts
            .get(group)
            .is_some_and(|videos| videos.contains_key(video_id))
    }

    /// Stores a transcript unless one already exists for that video in the
    /// group. Existing entries are never overwritten.
    pub fn insert_transcript(&mut self, group: &str, video_id: &str, entry: TranscriptEntry) -> bool {
        let videos = self.transcripts.entry(group.to_string()).or_default();
        if videos.contains_key(video_id) {
            return false;
        }
        videos.insert(video_id.to_string(), entry);
        true
    }

    pub fn transcript_count(&self) -> usize {
        self.transcripts.values().map(BTreeMap::len).sum()
    }

    /// Records a failure, replacing any earlier entry for the same URL.
    pub fn record_failure(&mut self, url: &str, kind: FailureKind, error: &str) {
        self.failed_downloads.retain(|failed| failed.url != url);
        self.failed_downloads.push(FailedDownload {
            url: url.to_string(),
            error: error.to_string(),
            kind,
            failed_at: Some(Utc::now()),
        });
    }

    pub fn clear_failure(&mut self, url: &str) {
        self.failed_downloads.retain(|failed| failed.url != url);
    }

    pub fn record_unavailable(&mut self, item: UnavailableItem) {
        self.unavailable.retain(|existing| existing.url != item.url);
        self.unavailable.push(item);
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Owns the location of the ledger file.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing file or an unreadable/corrupt one yields an empty
    /// record.
    pub fn load(&self) -> LedgerRecord {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no ledger at {}, starting empty", self.path.display());
                return LedgerRecord::default();
            }
            Err(err) => {
                warn!("could not read ledger {}: {err}", self.path.display());
                return LedgerRecord::default();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    "ledger {} is not valid JSON ({err}); starting empty",
                    self.path.display()
                );
                LedgerRecord::default()
            }
        }
    }

    /// Overwrites the file with the full record. The payload goes to a
    /// sibling temp file first and is renamed into place.
    pub fn save(&self, record: &LedgerRecord) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let payload = serde_json::to_vec_pretty(record).context("serializing ledger")?;
        let mut tmp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        tmp.write_all(&payload)
            .with_context(|| format!("writing ledger for {}", self.path.display()))?;
        tmp.persist(&self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        debug!(
            "saved ledger {} ({} bytes)",
            self.path.display(),
            payload.len()
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<LedgerRecord> {
        let record = LedgerRecord::default();
        self.save(&record)?;
        Ok(record)
    }
}
