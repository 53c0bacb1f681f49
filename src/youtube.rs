#![forbid(unsafe_code)]

//! URL and identifier handling for YouTube inputs.
//!
//! Everything a user pastes goes through [`parse_video_url`] or
//! [`validate_channel_name`] before any external call is made.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, FetchResult};

const VIDEO_ID_LEN: usize = 11;
const MAX_CHANNEL_NAME_LEN: usize = 100;

static WATCH_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:www\.|m\.)?youtube\.com/watch\?(?:[^#]*&)?v=([A-Za-z0-9_-]{11})(?:[&#].*)?$")
        .expect("static regex")
});
static SHORTS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:www\.|m\.)?youtube\.com/shorts/([A-Za-z0-9_-]{11})(?:[/?#].*)?$")
        .expect("static regex")
});
static SHORT_LINK_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://youtu\.be/([A-Za-z0-9_-]{11})(?:[/?#].*)?$").expect("static regex")
});

/// Distinguishes long-form uploads from Shorts so canonical URLs round-trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Short,
}

/// A validated reference to a single video.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoRef {
    pub video_id: String,
    pub kind: MediaKind,
}

impl VideoRef {
    pub fn new(video_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            video_id: video_id.into(),
            kind,
        }
    }

    /// Canonical URL handed to yt-dlp.
    pub fn url(&self) -> String {
        video_url_for_kind(&self.video_id, self.kind)
    }
}

impl fmt::Display for VideoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.video_id)
    }
}

pub fn video_url_for_kind(video_id: &str, kind: MediaKind) -> String {
    match kind {
        MediaKind::Video => format!("https://www.youtube.com/watch?v={video_id}"),
        MediaKind::Short => format!("https://www.youtube.com/shorts/{video_id}"),
    }
}

/// Accepts `watch?v=`, `/shorts/` and `youtu.be/` links. Anything else is an
/// `InvalidInput` failure.
pub fn parse_video_url(raw: &str) -> FetchResult<VideoRef> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(FetchError::invalid_input("empty URL"));
    }

    if let Some(caps) = WATCH_URL.captures(url) {
        return Ok(VideoRef::new(&caps[1], MediaKind::Video));
    }
    if let Some(caps) = SHORTS_URL.captures(url) {
        return Ok(VideoRef::new(&caps[1], MediaKind::Short));
    }
    if let Some(caps) = SHORT_LINK_URL.captures(url) {
        return Ok(VideoRef::new(&caps[1], MediaKind::Video));
    }

    Err(FetchError::invalid_input(format!(
        "not a YouTube video URL: {url}"
    )))
}

pub fn is_valid_video_id(value: &str) -> bool {
    value.len() == VIDEO_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Channel names are free text but must be non-empty, single-line and short.
pub fn validate_channel_name(raw: &str) -> FetchResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(FetchError::invalid_input("channel name is empty"));
    }
    if name.chars().count() > MAX_CHANNEL_NAME_LEN {
        return Err(FetchError::invalid_input(format!(
            "channel name longer than {MAX_CHANNEL_NAME_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(FetchError::invalid_input(
            "channel name contains control characters",
        ));
    }
    Ok(name.to_string())
}

/// Resolution choices offered by the video downloader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    #[default]
    Best,
    #[serde(rename = "1080")]
    P1080,
    #[serde(rename = "720")]
    P720,
    #[serde(rename = "360")]
    P360,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [Self::Best, Self::P1080, Self::P720, Self::P360];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::P1080 => "1080",
            Self::P720 => "720",
            Self::P360 => "360",
        }
    }

    /// yt-dlp `--format` selector. Every choice stays within mp4/m4a so no
    /// re-encoding is needed.
    pub fn format_selector(self) -> &'static str {
        match self {
            Self::Best => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]",
            Self::P1080 => {
                "bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/best[height<=1080][ext=mp4]"
            }
            Self::P720 => {
                "bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]/best[height<=720][ext=mp4]"
            }
            Self::P360 => {
                "bestvideo[height<=360][ext=mp4]+bestaudio[ext=m4a]/best[height<=360][ext=mp4]"
            }
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = FetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().trim_end_matches('p') {
            "" | "best" => Ok(Self::Best),
            "1080" => Ok(Self::P1080),
            "720" => Ok(Self::P720),
            "360" => Ok(Self::P360),
            other => Err(FetchError::invalid_input(format!(
                "unknown resolution: {other}"
            ))),
        }
    }
}
