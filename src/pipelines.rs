#![forbid(unsafe_code)]

//! One function per feature, each wiring a collaborator into the batch
//! orchestrator. Both binaries go through these.

use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::export::channel_csv;
use crate::ledger::DEFAULT_GROUP;
use crate::orchestrator::{BatchProgress, BatchReport, run_batch};
use crate::session::Session;
use crate::sources::{ChannelResolver, ChannelVideo, ThumbnailSource, TranscriptSource, VideoDownloader};
use crate::thumbnail::save_thumbnail;
use crate::youtube::Resolution;

pub fn transcripts_batch<S: AsRef<str>>(
    session: &mut Session,
    source: &dyn TranscriptSource,
    urls: &[S],
    group: &str,
    on_progress: impl FnMut(&BatchProgress<'_>),
) -> Result<BatchReport> {
    run_batch(
        session,
        urls,
        group,
        |video| source.fetch_transcript(video),
        on_progress,
    )
}

/// Fetches thumbnails and stores each image under `dir`.
pub fn thumbnails_batch<S: AsRef<str>>(
    session: &mut Session,
    source: &dyn ThumbnailSource,
    dir: &Path,
    urls: &[S],
    on_progress: impl FnMut(&BatchProgress<'_>),
) -> Result<BatchReport> {
    run_batch(
        session,
        urls,
        DEFAULT_GROUP,
        |video| {
            let thumbnail = source.fetch_thumbnail(video)?;
            save_thumbnail(dir, thumbnail)
        },
        on_progress,
    )
}

/// `on_bytes` sees the byte counters of whichever item is downloading.
pub fn videos_batch<S: AsRef<str>>(
    session: &mut Session,
    downloader: &dyn VideoDownloader,
    urls: &[S],
    resolution: Resolution,
    mut on_bytes: impl FnMut(u64, Option<u64>),
    on_progress: impl FnMut(&BatchProgress<'_>),
) -> Result<BatchReport> {
    run_batch(
        session,
        urls,
        DEFAULT_GROUP,
        |video| downloader.fetch_video(video, resolution, &mut on_bytes),
        on_progress,
    )
}

#[derive(Debug, Clone)]
pub struct ChannelListing {
    pub name: String,
    pub videos: Vec<ChannelVideo>,
}

impl ChannelListing {
    pub fn urls(&self) -> Vec<&str> {
        self.videos.iter().map(|video| video.url.as_str()).collect()
    }

    pub fn to_csv(&self) -> Result<String> {
        channel_csv(&self.videos)
    }
}

pub fn list_channel(resolver: &dyn ChannelResolver, name: &str) -> Result<ChannelListing> {
    let videos = resolver.resolve_channel(name)?;
    Ok(ChannelListing {
        name: name.trim().to_string(),
        videos,
    })
}

/// Lists a channel and fetches every transcript into the channel's group.
pub fn channel_transcripts(
    session: &mut Session,
    resolver: &dyn ChannelResolver,
    source: &dyn TranscriptSource,
    name: &str,
    on_progress: impl FnMut(&BatchProgress<'_>),
) -> Result<(ChannelListing, BatchReport)> {
    let listing = list_channel(resolver, name)?;
    info!(
        "fetching transcripts for {} video(s) of \"{}\"",
        listing.videos.len(),
        listing.name
    );
    let report = transcripts_batch(session, source, &listing.urls(), &listing.name, on_progress)?;
    Ok((listing, report))
}
