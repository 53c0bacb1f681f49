#![forbid(unsafe_code)]

//! Transcripts via yt-dlp caption metadata.
//!
//! yt-dlp lists the caption tracks and their signed URLs; the chosen track is
//! then downloaded over HTTP and flattened to plain text, one caption line per
//! output line.

use std::collections::HashMap;
use std::io::Read;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::{FetchError, FetchResult};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::sources::{Transcript, TranscriptSource};
use crate::youtube::{VideoRef, is_valid_video_id};
use crate::ytdlp::{CaptionFormat, VideoInfo, YtDlp};

pub const PREFERRED_LANGUAGES: [&str; 2] = ["en", "es"];
const PREFERRED_FORMATS: [&str; 2] = ["json3", "vtt"];
const MAX_CAPTION_BYTES: u64 = 32 * 1024 * 1024;

static INLINE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("inline tag regex"));

/// Caption track picked for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionChoice {
    pub language: String,
    pub automatic: bool,
    pub ext: String,
    pub url: String,
}

/// Preferred languages first (manual, then automatic for each), then any
/// manual track, then any automatic one.
pub fn select_caption(info: &VideoInfo) -> Option<CaptionChoice> {
    let pools = [(&info.subtitles, false), (&info.automatic_captions, true)];

    for language in PREFERRED_LANGUAGES {
        for (pool, automatic) in pools {
            if let Some(choice) = choice_from(pool, language, automatic) {
                return Some(choice);
            }
        }
    }

    for (pool, automatic) in pools {
        let mut languages: Vec<&String> = pool.keys().collect();
        languages.sort();
        for language in languages {
            if let Some(choice) = choice_from(pool, language, automatic) {
                return Some(choice);
            }
        }
    }
    None
}

fn choice_from(
    pool: &HashMap<String, Vec<CaptionFormat>>,
    language: &str,
    automatic: bool,
) -> Option<CaptionChoice> {
    let formats = pool.get(language)?;
    let usable = || formats.iter().filter(|format| format.url.is_some());

    let format = PREFERRED_FORMATS
        .iter()
        .find_map(|ext| usable().find(|format| format.ext.as_deref() == Some(*ext)))
        .or_else(|| usable().next())?;

    Some(CaptionChoice {
        language: language.to_string(),
        automatic,
        ext: format.ext.clone().unwrap_or_default(),
        url: format.url.clone()?,
    })
}

#[derive(Debug, Deserialize)]
struct Json3 {
    #[serde(default)]
    events: Vec<Json3Event>,
}

#[derive(Debug, Deserialize)]
struct Json3Event {
    #[serde(default)]
    segs: Vec<Json3Segment>,
}

#[derive(Debug, Deserialize)]
struct Json3Segment {
    #[serde(default)]
    utf8: String,
}

/// Flattens a caption payload. JSON bodies are read as json3 events; anything
/// else (or JSON that does not parse) is treated as WebVTT.
pub fn caption_text(body: &str) -> String {
    if body.trim_start().starts_with('{') {
        match serde_json::from_str::<Json3>(body) {
            Ok(parsed) => return json3_text(&parsed),
            Err(err) => debug!("caption body is not json3 ({err}), trying VTT"),
        }
    }
    vtt_text(body)
}

fn json3_text(parsed: &Json3) -> String {
    parsed
        .events
        .iter()
        .map(|event| {
            event
                .segs
                .iter()
                .map(|seg| seg.utf8.as_str())
                .collect::<String>()
        })
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn vtt_text(body: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for raw in body.lines() {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.contains("-->")
            || trimmed.starts_with("WEBVTT")
            || trimmed.starts_with("Kind:")
            || trimmed.starts_with("Language:")
        {
            continue;
        }
        let cleaned = INLINE_TAG.replace_all(trimmed, "").trim().to_string();
        // Rolling automatic captions repeat the previous line.
        if cleaned.is_empty() || lines.last() == Some(&cleaned) {
            continue;
        }
        lines.push(cleaned);
    }
    lines.join("\n")
}

pub struct YtDlpTranscripts {
    ytdlp: YtDlp,
    agent: ureq::Agent,
    policy: RetryPolicy,
}

impl YtDlpTranscripts {
    pub fn new(ytdlp: YtDlp, policy: RetryPolicy) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(60))
            .build();
        Self {
            ytdlp,
            agent,
            policy,
        }
    }

    fn fetch_once(&self, video: &VideoRef) -> FetchResult<Transcript> {
        let info = self.ytdlp.fetch_info(&video.url())?;
        let video_id = info
            .id
            .clone()
            .filter(|id| is_valid_video_id(id))
            .unwrap_or_else(|| video.video_id.clone());
        let title = info.display_title(&video_id);

        let choice = select_caption(&info).ok_or_else(|| {
            FetchError::disabled(format!("no captions available for {video_id}"))
        })?;
        debug!(
            "using {} caption track ({}, automatic: {}) for {video_id}",
            choice.language, choice.ext, choice.automatic
        );

        let body = self.download(&choice.url)?;
        let transcript_text = caption_text(&body);
        if transcript_text.is_empty() {
            return Err(FetchError::disabled(format!(
                "caption track for {video_id} is empty"
            )));
        }

        Ok(Transcript {
            video_id,
            title,
            transcript_text,
        })
    }

    fn download(&self, url: &str) -> FetchResult<String> {
        let response = self.agent.get(url).call().map_err(|err| match err {
            ureq::Error::Status(code, _) => {
                FetchError::network(format!("caption download returned HTTP {code}"))
            }
            ureq::Error::Transport(err) => {
                FetchError::network(format!("caption download failed: {err}"))
            }
        })?;

        let mut body = String::new();
        response
            .into_reader()
            .take(MAX_CAPTION_BYTES)
            .read_to_string(&mut body)
            .map_err(|err| FetchError::network(format!("reading captions: {err}")))?;
        Ok(body)
    }
}

impl TranscriptSource for YtDlpTranscripts {
    fn fetch_transcript(&self, video: &VideoRef) -> FetchResult<Transcript> {
        retry_with_backoff(&self.policy, &video.video_id, |_| self.fetch_once(video))
    }
}
