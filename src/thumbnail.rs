#![forbid(unsafe_code)]

//! Thumbnail retrieval from the public image host.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{FetchError, FetchResult};
use crate::ledger::ThumbnailEntry;
use crate::sources::{Thumbnail, ThumbnailSource};
use crate::youtube::VideoRef;

pub const DEFAULT_THUMBNAIL_HOST: &str = "https://img.youtube.com";

/// Qualities tried in order; the first one served wins.
pub const THUMBNAIL_LADDER: [&str; 3] = ["maxresdefault", "hqdefault", "mqdefault"];

const MAX_THUMBNAIL_BYTES: u64 = 16 * 1024 * 1024;

/// A thumbnail written to disk, ready to be recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedThumbnail {
    pub video_id: String,
    pub quality: String,
    pub path: PathBuf,
}

impl SavedThumbnail {
    pub fn into_entry(self, url: &str) -> ThumbnailEntry {
        ThumbnailEntry {
            url: url.to_string(),
            quality: self.quality,
            path: self.path,
        }
    }
}

pub fn thumbnail_url(base_url: &str, video_id: &str, quality: &str) -> String {
    format!("{}/vi/{video_id}/{quality}.jpg", base_url.trim_end_matches('/'))
}

/// Walks `ladder` calling `get` per quality. `Ok(None)` means "not served at
/// this quality, try the next one"; an error stops the walk.
pub fn first_available(
    video_id: &str,
    ladder: &[&str],
    mut get: impl FnMut(&str) -> FetchResult<Option<Vec<u8>>>,
) -> FetchResult<(String, Vec<u8>)> {
    for quality in ladder {
        if let Some(bytes) = get(quality)? {
            return Ok(((*quality).to_string(), bytes));
        }
        debug!("no {quality} thumbnail for {video_id}");
    }
    Err(FetchError::not_found(format!(
        "no thumbnail available for {video_id}"
    )))
}

#[derive(Debug, Clone)]
pub struct HttpThumbnails {
    agent: ureq::Agent,
    base_url: String,
}

impl Default for HttpThumbnails {
    fn default() -> Self {
        Self::new(DEFAULT_THUMBNAIL_HOST)
    }
}

impl HttpThumbnails {
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();
        Self {
            agent,
            base_url: base_url.into(),
        }
    }

    fn get(&self, url: &str) -> FetchResult<Option<Vec<u8>>> {
        match self.agent.get(url).call() {
            Ok(response) => {
                let mut bytes = Vec::new();
                response
                    .into_reader()
                    .take(MAX_THUMBNAIL_BYTES)
                    .read_to_end(&mut bytes)
                    .map_err(|err| FetchError::network(format!("reading {url}: {err}")))?;
                Ok(Some(bytes))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(ureq::Error::Status(code, _)) => {
                Err(FetchError::network(format!("{url} returned HTTP {code}")))
            }
            Err(ureq::Error::Transport(err)) => {
                Err(FetchError::network(format!("requesting {url}: {err}")))
            }
        }
    }
}

impl ThumbnailSource for HttpThumbnails {
    fn fetch_thumbnail(&self, video: &VideoRef) -> FetchResult<Thumbnail> {
        let (quality, bytes) = first_available(&video.video_id, &THUMBNAIL_LADDER, |quality| {
            self.get(&thumbnail_url(&self.base_url, &video.video_id, quality))
        })?;
        Ok(Thumbnail {
            video_id: video.video_id.clone(),
            source_url: thumbnail_url(&self.base_url, &video.video_id, &quality),
            quality,
            bytes,
        })
    }
}

/// Writes the image as `<dir>/<video_id>_<quality>.jpg`.
pub fn save_thumbnail(dir: &Path, thumbnail: Thumbnail) -> FetchResult<SavedThumbnail> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}_{}.jpg", thumbnail.video_id, thumbnail.quality));
    fs::write(&path, &thumbnail.bytes)?;
    Ok(SavedThumbnail {
        video_id: thumbnail.video_id,
        quality: thumbnail.quality,
        path,
    })
}
