#![forbid(unsafe_code)]

use tracing::{debug, info};

use crate::error::{FetchError, FetchResult};
use crate::sources::{ChannelResolver, ChannelVideo};
use crate::youtube::{MediaKind, is_valid_video_id, validate_channel_name, video_url_for_kind};
use crate::ytdlp::{FlatPlaylist, YtDlp};

const CHANNEL_ID_LEN: usize = 24;

/// Where a channel name points before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTarget {
    /// Already addressable: a `/videos` tab URL.
    Direct(String),
    /// Free text that has to go through a search first.
    Search(String),
}

pub fn channel_target(name: &str) -> ChannelTarget {
    if name.starts_with("http://") || name.starts_with("https://") {
        let base = name.trim_end_matches('/');
        if base.ends_with("/videos") {
            return ChannelTarget::Direct(base.to_string());
        }
        return ChannelTarget::Direct(format!("{base}/videos"));
    }
    if name.starts_with('@') && !name.contains(char::is_whitespace) {
        return ChannelTarget::Direct(format!("https://www.youtube.com/{name}/videos"));
    }
    if looks_like_channel_id(name) {
        return ChannelTarget::Direct(channel_videos_url(name));
    }
    ChannelTarget::Search(name.to_string())
}

fn looks_like_channel_id(value: &str) -> bool {
    value.len() == CHANNEL_ID_LEN
        && value.starts_with("UC")
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

pub fn channel_videos_url(channel_id: &str) -> String {
    format!("https://www.youtube.com/channel/{channel_id}/videos")
}

/// Keeps entries with a usable video id, in listing order.
pub fn listing_videos(listing: FlatPlaylist) -> Vec<ChannelVideo> {
    listing
        .entries
        .into_iter()
        .filter_map(|entry| {
            let video_id = entry.id.filter(|id| is_valid_video_id(id))?;
            let title = entry
                .title
                .map(|title| title.trim().to_string())
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| format!("Video {video_id}"));
            Some(ChannelVideo {
                url: video_url_for_kind(&video_id, MediaKind::Video),
                video_id,
                title,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct YtDlpChannels {
    ytdlp: YtDlp,
}

impl YtDlpChannels {
    pub fn new(ytdlp: YtDlp) -> Self {
        Self { ytdlp }
    }

    /// First search hit's channel id.
    fn search_channel_id(&self, query: &str) -> FetchResult<String> {
        let results = self.ytdlp.flat_playlist(&format!("ytsearch1:{query}"))?;
        results
            .entries
            .into_iter()
            .find_map(|entry| entry.channel_id)
            .ok_or_else(|| FetchError::not_found(format!("no channel found for \"{query}\"")))
    }
}

impl ChannelResolver for YtDlpChannels {
    fn resolve_channel(&self, name: &str) -> FetchResult<Vec<ChannelVideo>> {
        let name = validate_channel_name(name)?;
        let listing_url = match channel_target(&name) {
            ChannelTarget::Direct(url) => url,
            ChannelTarget::Search(query) => {
                let channel_id = self.search_channel_id(&query)?;
                debug!("resolved \"{query}\" to channel {channel_id}");
                channel_videos_url(&channel_id)
            }
        };

        let videos = listing_videos(self.ytdlp.flat_playlist(&listing_url)?);
        if videos.is_empty() {
            return Err(FetchError::not_found(format!(
                "channel \"{name}\" has no videos"
            )));
        }
        info!("channel \"{name}\" lists {} video(s)", videos.len());
        Ok(videos)
    }
}
