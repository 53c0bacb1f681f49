#![forbid(unsafe_code)]

//! Narrow interfaces to the external extractors. Internal code only sees these
//! typed results and [`FetchError`]; raw yt-dlp JSON never leaks past the
//! implementations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::FetchResult;
use crate::youtube::{Resolution, VideoRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub video_id: String,
    pub title: String,
    pub transcript_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelVideo {
    pub video_id: String,
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub video_id: String,
    /// Ladder rung that answered, e.g. `maxresdefault`.
    pub quality: String,
    pub source_url: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedVideo {
    pub video_id: String,
    pub title: String,
    pub path: PathBuf,
    pub resolution: Resolution,
}

pub trait ChannelResolver: Send + Sync {
    fn resolve_channel(&self, name: &str) -> FetchResult<Vec<ChannelVideo>>;
}

pub trait TranscriptSource: Send + Sync {
    fn fetch_transcript(&self, video: &VideoRef) -> FetchResult<Transcript>;
}

pub trait ThumbnailSource: Send + Sync {
    fn fetch_thumbnail(&self, video: &VideoRef) -> FetchResult<Thumbnail>;
}

/// Receives `(downloaded_bytes, total_bytes)` repeatedly while a transfer runs.
pub type ByteProgress<'a> = &'a mut dyn FnMut(u64, Option<u64>);

pub trait VideoDownloader: Send + Sync {
    fn fetch_video(
        &self,
        video: &VideoRef,
        resolution: Resolution,
        progress: ByteProgress<'_>,
    ) -> FetchResult<DownloadedVideo>;
}
