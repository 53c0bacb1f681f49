#![forbid(unsafe_code)]

//! Sequential batch processing on top of the ledger.
//!
//! Each URL is fully handled (validation, fetch, ledger update, save,
//! progress report) before the next one starts. A failing item is recorded and
//! the loop moves on; only a ledger write error ends a batch early.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{FailureKind, FetchResult};
use crate::ledger::{DownloadProgress, LedgerRecord, TranscriptEntry, UnavailableItem, VideoEntry};
use crate::session::Session;
use crate::sources::{DownloadedVideo, Transcript};
use crate::thumbnail::SavedThumbnail;
use crate::youtube::{VideoRef, parse_video_url};

/// A fetch result that knows where it lives in the ledger.
pub trait LedgerItem {
    fn video_id(&self) -> &str;

    /// Key under `processed_links` for batches of this item kind.
    fn link_scope(group: &str) -> String;

    fn is_recorded(record: &LedgerRecord, group: &str, video_id: &str) -> bool;

    /// Adds the item. Only called when [`LedgerItem::is_recorded`] is false.
    fn store(self, record: &mut LedgerRecord, group: &str, url: &str);
}

impl LedgerItem for Transcript {
    fn video_id(&self) -> &str {
        &self.video_id
    }

    fn link_scope(group: &str) -> String {
        format!("transcripts:{group}")
    }

    fn is_recorded(record: &LedgerRecord, group: &str, video_id: &str) -> bool {
        record.has_transcript(group, video_id)
    }

    fn store(self, record: &mut LedgerRecord, group: &str, url: &str) {
        record.insert_transcript(
            group,
            &self.video_id,
            TranscriptEntry {
                title: self.title,
                transcript_text: self.transcript_text,
                url: url.to_string(),
            },
        );
    }
}

impl LedgerItem for SavedThumbnail {
    fn video_id(&self) -> &str {
        &self.video_id
    }

    fn link_scope(_group: &str) -> String {
        "thumbnails".to_string()
    }

    fn is_recorded(record: &LedgerRecord, _group: &str, video_id: &str) -> bool {
        record.thumbnails.contains_key(video_id)
    }

    fn store(self, record: &mut LedgerRecord, _group: &str, url: &str) {
        record
            .thumbnails
            .entry(self.video_id.clone())
            .or_insert_with(|| self.into_entry(url));
    }
}

impl LedgerItem for DownloadedVideo {
    fn video_id(&self) -> &str {
        &self.video_id
    }

    fn link_scope(_group: &str) -> String {
        "videos".to_string()
    }

    fn is_recorded(record: &LedgerRecord, _group: &str, video_id: &str) -> bool {
        record.videos.contains_key(video_id)
    }

    fn store(self, record: &mut LedgerRecord, _group: &str, url: &str) {
        record
            .videos
            .entry(self.video_id)
            .or_insert_with(|| VideoEntry {
                url: url.to_string(),
                title: self.title,
                path: self.path,
                resolution: self.resolution,
            });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Stored { video_id: String },
    /// URL already processed by this feature and group; nothing was fetched.
    SkippedLink,
    /// Same video already recorded, reached through this or another URL.
    SkippedDuplicate { video_id: String },
    /// NotFound/Disabled: recorded inline, not a failure.
    Unavailable { kind: FailureKind, message: String },
    Failed { kind: FailureKind, message: String },
}

impl ItemStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stored { .. } => "stored",
            Self::SkippedLink => "skipped (already processed)",
            Self::SkippedDuplicate { .. } => "skipped (duplicate video)",
            Self::Unavailable { .. } => "unavailable",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub url: String,
    #[serde(flatten)]
    pub status: ItemStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
    pub stored: usize,
    pub skipped: usize,
    pub unavailable: usize,
    pub failed: usize,
}

impl BatchReport {
    fn push(&mut self, url: &str, status: ItemStatus) {
        match status {
            ItemStatus::Stored { .. } => self.stored += 1,
            ItemStatus::SkippedLink | ItemStatus::SkippedDuplicate { .. } => self.skipped += 1,
            ItemStatus::Unavailable { .. } => self.unavailable += 1,
            ItemStatus::Failed { .. } => self.failed += 1,
        }
        self.items.push(ItemReport {
            url: url.to_string(),
            status,
        });
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn failed_urls(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter(|item| matches!(item.status, ItemStatus::Failed { .. }))
            .map(|item| item.url.as_str())
            .collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} processed: {} stored, {} skipped, {} unavailable, {} failed",
            self.total(),
            self.stored,
            self.skipped,
            self.unavailable,
            self.failed
        )
    }
}

/// Snapshot passed to the progress callback after every item.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress<'a> {
    pub processed: usize,
    pub total: usize,
    pub url: &'a str,
    pub status: &'a ItemStatus,
}

impl BatchProgress<'_> {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.processed * 100) / self.total).min(100) as u8
    }
}

/// Processes `urls` strictly in order against the session's ledger.
///
/// `fetch_one` is only invoked for URLs that are valid, not yet processed in
/// this item kind's link scope and whose video is not yet recorded under
/// `group`.
pub fn run_batch<T, S, F, P>(
    session: &mut Session,
    urls: &[S],
    group: &str,
    mut fetch_one: F,
    mut on_progress: P,
) -> Result<BatchReport>
where
    T: LedgerItem,
    S: AsRef<str>,
    F: FnMut(&VideoRef) -> FetchResult<T>,
    P: FnMut(&BatchProgress<'_>),
{
    let urls: Vec<&str> = urls
        .iter()
        .map(|url| url.as_ref().trim())
        .filter(|url| !url.is_empty())
        .collect();
    let total = urls.len();

    info!("starting batch of {total} item(s) for group {group}");
    session.update(|record| {
        record.download_progress = DownloadProgress {
            downloaded: 0,
            total: total as u64,
        };
    })?;

    let scope = T::link_scope(group);
    let mut report = BatchReport::default();
    for (index, url) in urls.iter().copied().enumerate() {
        let (status, item) = process_item(session.record(), &scope, url, group, &mut fetch_one);
        debug!("[{}/{}] {url}: {}", index + 1, total, status.label());

        session.update(|record| {
            if let Some(item) = item {
                item.store(record, group, url);
            }
            apply_status(record, &scope, url, &status);
        })?;

        on_progress(&BatchProgress {
            processed: index + 1,
            total,
            url,
            status: &status,
        });
        report.push(url, status);
    }

    info!("batch for group {group} finished: {}", report.summary());
    Ok(report)
}

/// Decides the outcome of one URL without touching the ledger. A fresh item
/// to store is returned alongside its status.
fn process_item<T, F>(
    record: &LedgerRecord,
    scope: &str,
    url: &str,
    group: &str,
    fetch_one: &mut F,
) -> (ItemStatus, Option<T>)
where
    T: LedgerItem,
    F: FnMut(&VideoRef) -> FetchResult<T>,
{
    if record.has_processed(scope, url) {
        return (ItemStatus::SkippedLink, None);
    }

    let video = match parse_video_url(url) {
        Ok(video) => video,
        Err(err) => {
            warn!("rejecting {url}: {err}");
            let status = ItemStatus::Failed {
                kind: err.kind,
                message: err.message,
            };
            return (status, None);
        }
    };

    if T::is_recorded(record, group, &video.video_id) {
        let status = ItemStatus::SkippedDuplicate {
            video_id: video.video_id,
        };
        return (status, None);
    }

    match fetch_one(&video) {
        Ok(item) => {
            let video_id = item.video_id().to_string();
            if T::is_recorded(record, group, &video_id) {
                (ItemStatus::SkippedDuplicate { video_id }, None)
            } else {
                (ItemStatus::Stored { video_id }, Some(item))
            }
        }
        Err(err) if err.kind.is_unavailable() => {
            info!("{url} unavailable: {err}");
            let status = ItemStatus::Unavailable {
                kind: err.kind,
                message: err.message,
            };
            (status, None)
        }
        Err(err) => {
            warn!("failed to process {url}: {err}");
            let status = ItemStatus::Failed {
                kind: err.kind,
                message: err.message,
            };
            (status, None)
        }
    }
}

fn apply_status(record: &mut LedgerRecord, scope: &str, url: &str, status: &ItemStatus) {
    match status {
        ItemStatus::Stored { .. } | ItemStatus::SkippedDuplicate { .. } => {
            record.mark_processed(scope, url);
            record.clear_failure(url);
        }
        ItemStatus::SkippedLink => {}
        ItemStatus::Unavailable { kind, message } => {
            record.mark_processed(scope, url);
            record.clear_failure(url);
            record.record_unavailable(UnavailableItem {
                url: url.to_string(),
                video_id: parse_video_url(url).ok().map(|video| video.video_id),
                kind: *kind,
                message: message.clone(),
            });
        }
        ItemStatus::Failed { kind, message } => {
            record.record_failure(url, *kind, message);
        }
    }
    record.download_progress.downloaded += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::ledger::LedgerStore;
    use std::collections::HashMap;
    use tempfile::{TempDir, tempdir};

    const URL_A: &str = "https://www.youtube.com/watch?v=aaaaaaaaaaa";
    const URL_B: &str = "https://www.youtube.com/watch?v=bbbbbbbbbbb";
    const URL_C: &str = "https://www.youtube.com/watch?v=ccccccccccc";
    const URL_A_SHORT_LINK: &str = "https://youtu.be/aaaaaaaaaaa";

    fn temp_session() -> (TempDir, LedgerStore, Session) {
        let dir = tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("data").join("state.json"));
        let session = Session::open(store.clone());
        (dir, store, session)
    }

    fn transcript(id: &str, title: &str) -> Transcript {
        Transcript {
            video_id: id.into(),
            title: title.into(),
            transcript_text: format!("text of {title}"),
        }
    }

    /// Fake collaborator answering from a table and counting calls per id.
    struct FakeTranscripts {
        answers: HashMap<String, FetchResult<Transcript>>,
        calls: Vec<String>,
    }

    impl FakeTranscripts {
        fn new(answers: Vec<(&str, FetchResult<Transcript>)>) -> Self {
            Self {
                answers: answers
                    .into_iter()
                    .map(|(id, answer)| (id.to_string(), answer))
                    .collect(),
                calls: Vec::new(),
            }
        }

        fn fetch(&mut self, video: &VideoRef) -> FetchResult<Transcript> {
            self.calls.push(video.video_id.clone());
            self.answers
                .get(&video.video_id)
                .cloned()
                .unwrap_or_else(|| Err(FetchError::not_found("unknown video")))
        }
    }

    fn run(
        session: &mut Session,
        urls: &[&str],
        fake: &mut FakeTranscripts,
    ) -> BatchReport {
        run_batch(session, urls, "Chan", |video| fake.fetch(video), |_| {}).unwrap()
    }

    #[test]
    fn stores_success_and_records_disabled_inline() {
        let (_dir, store, mut session) = temp_session();
        let mut fake = FakeTranscripts::new(vec![
            ("aaaaaaaaaaa", Ok(transcript("aaaaaaaaaaa", "T1"))),
            ("bbbbbbbbbbb", Err(FetchError::disabled("captions disabled"))),
        ]);

        let report = run(&mut session, &[URL_A, URL_B], &mut fake);
        assert_eq!(report.stored, 1);
        assert_eq!(report.unavailable, 1);
        assert_eq!(report.failed, 0);

        let record = store.load();
        assert_eq!(record.transcripts["Chan"]["aaaaaaaaaaa"].title, "T1");
        assert_eq!(record.transcripts["Chan"]["aaaaaaaaaaa"].url, URL_A);
        assert!(record.failed_downloads.is_empty());
        assert_eq!(record.downloaded_links, vec![URL_A, URL_B]);
        assert_eq!(record.unavailable.len(), 1);
        assert_eq!(record.unavailable[0].kind, FailureKind::Disabled);
        assert_eq!(record.unavailable[0].video_id.as_deref(), Some("bbbbbbbbbbb"));
        assert_eq!(
            record.download_progress,
            DownloadProgress {
                downloaded: 2,
                total: 2
            }
        );
    }

    #[test]
    fn second_run_is_idempotent_and_fetches_nothing() {
        let (_dir, store, mut session) = temp_session();
        let mut fake = FakeTranscripts::new(vec![
            ("aaaaaaaaaaa", Ok(transcript("aaaaaaaaaaa", "T1"))),
            ("bbbbbbbbbbb", Err(FetchError::not_found("removed"))),
        ]);

        run(&mut session, &[URL_A, URL_B], &mut fake);
        let after_first = store.load();
        fake.calls.clear();

        let report = run(&mut session, &[URL_A, URL_B], &mut fake);
        assert!(fake.calls.is_empty());
        assert_eq!(report.skipped, 2);
        assert!(
            report
                .items
                .iter()
                .all(|item| item.status == ItemStatus::SkippedLink)
        );
        assert_eq!(store.load(), after_first);
    }

    #[test]
    fn same_video_through_other_url_is_skipped_not_overwritten() {
        let (_dir, store, mut session) = temp_session();
        let mut fake = FakeTranscripts::new(vec![(
            "aaaaaaaaaaa",
            Ok(transcript("aaaaaaaaaaa", "Original")),
        )]);
        run(&mut session, &[URL_A], &mut fake);

        fake.answers.insert(
            "aaaaaaaaaaa".into(),
            Ok(transcript("aaaaaaaaaaa", "Changed")),
        );
        fake.calls.clear();
        let report = run(&mut session, &[URL_A_SHORT_LINK], &mut fake);

        assert!(fake.calls.is_empty());
        assert_eq!(
            report.items[0].status,
            ItemStatus::SkippedDuplicate {
                video_id: "aaaaaaaaaaa".into()
            }
        );
        let record = store.load();
        assert_eq!(record.transcripts["Chan"]["aaaaaaaaaaa"].title, "Original");
        assert!(record.has_link(URL_A_SHORT_LINK));
    }

    #[test]
    fn duplicate_detected_from_fetched_id() {
        let (_dir, store, mut session) = temp_session();
        // URL_C resolves to a video that is already stored under another id's URL.
        let mut fake = FakeTranscripts::new(vec![
            ("aaaaaaaaaaa", Ok(transcript("aaaaaaaaaaa", "Original"))),
            ("ccccccccccc", Ok(transcript("aaaaaaaaaaa", "Redirected"))),
        ]);
        let report = run(&mut session, &[URL_A, URL_C], &mut fake);
        assert_eq!(fake.calls, vec!["aaaaaaaaaaa", "ccccccccccc"]);
        assert_eq!(report.stored, 1);
        assert_eq!(report.skipped, 1);
        let record = store.load();
        assert_eq!(record.transcripts["Chan"].len(), 1);
        assert_eq!(record.transcripts["Chan"]["aaaaaaaaaaa"].title, "Original");
    }

    #[test]
    fn failing_item_does_not_stop_the_batch() {
        let (_dir, store, mut session) = temp_session();
        let mut fake = FakeTranscripts::new(vec![
            ("aaaaaaaaaaa", Ok(transcript("aaaaaaaaaaa", "A"))),
            (
                "bbbbbbbbbbb",
                Err(FetchError::network("timed out after 5 attempts")),
            ),
            ("ccccccccccc", Ok(transcript("ccccccccccc", "C"))),
        ]);

        let report = run(&mut session, &[URL_A, URL_B, URL_C], &mut fake);
        assert_eq!(report.failed_urls(), vec![URL_B]);
        assert_eq!(report.stored, 2);

        let record = store.load();
        let failed: Vec<&str> = record
            .failed_downloads
            .iter()
            .map(|failed| failed.url.as_str())
            .collect();
        assert_eq!(failed, vec![URL_B]);
        assert_eq!(record.failed_downloads[0].kind, FailureKind::NetworkError);
        assert!(!record.has_link(URL_B));
        assert!(record.has_transcript("Chan", "ccccccccccc"));
    }

    #[test]
    fn failed_urls_are_retried_and_cleared_on_success() {
        let (_dir, store, mut session) = temp_session();
        let mut fake = FakeTranscripts::new(vec![(
            "bbbbbbbbbbb",
            Err(FetchError::network("reset")),
        )]);
        run(&mut session, &[URL_B], &mut fake);
        assert_eq!(store.load().failed_downloads.len(), 1);

        fake.answers
            .insert("bbbbbbbbbbb".into(), Ok(transcript("bbbbbbbbbbb", "B")));
        let report = run(&mut session, &[URL_B], &mut fake);
        assert_eq!(report.stored, 1);
        let record = store.load();
        assert!(record.failed_downloads.is_empty());
        assert!(record.has_link(URL_B));
    }

    #[test]
    fn invalid_urls_never_reach_the_collaborator() {
        let (_dir, store, mut session) = temp_session();
        let mut fake = FakeTranscripts::new(vec![]);
        let report = run(&mut session, &["https://example.com/nope"], &mut fake);
        assert!(fake.calls.is_empty());
        assert_eq!(
            report.items[0].status,
            ItemStatus::Failed {
                kind: FailureKind::InvalidInput,
                message: "not a YouTube video URL: https://example.com/nope".into()
            }
        );
        assert_eq!(store.load().failed_downloads[0].kind, FailureKind::InvalidInput);
    }

    #[test]
    fn resumes_after_interruption() {
        let (_dir, store, mut session) = temp_session();
        let urls = [URL_A, URL_B, URL_C];
        let mut fake = FakeTranscripts::new(vec![
            ("aaaaaaaaaaa", Ok(transcript("aaaaaaaaaaa", "A"))),
            ("bbbbbbbbbbb", Ok(transcript("bbbbbbbbbbb", "B"))),
            ("ccccccccccc", Ok(transcript("ccccccccccc", "C"))),
        ]);

        // Simulate a crash after the first item by processing only a prefix.
        run(&mut session, &urls[..1], &mut fake);
        drop(session);

        let mut restarted = Session::open(store.clone());
        fake.calls.clear();
        let report = run(&mut restarted, &urls, &mut fake);
        assert_eq!(fake.calls, vec!["bbbbbbbbbbb", "ccccccccccc"]);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.stored, 2);
        assert_eq!(store.load().transcript_count(), 3);
    }

    #[test]
    fn progress_is_reported_after_every_item_and_persisted() {
        let (_dir, store, mut session) = temp_session();
        let mut fake = FakeTranscripts::new(vec![
            ("aaaaaaaaaaa", Ok(transcript("aaaaaaaaaaa", "A"))),
            ("bbbbbbbbbbb", Ok(transcript("bbbbbbbbbbb", "B"))),
        ]);
        let mut seen = Vec::new();
        run_batch(
            &mut session,
            &[URL_A, "  ", URL_B],
            "Chan",
            |video| {
                // The ledger on disk already reflects every earlier item.
                let on_disk = store.load();
                assert_eq!(on_disk.download_progress.downloaded as usize, fake.calls.len());
                fake.fetch(video)
            },
            |progress| seen.push((progress.processed, progress.total, progress.percent())),
        )
        .unwrap();
        assert_eq!(seen, vec![(1, 2, 50), (2, 2, 100)]);
    }

    #[test]
    fn thumbnails_and_videos_use_their_own_maps() {
        use crate::youtube::Resolution;
        use std::path::PathBuf;

        let (_dir, store, mut session) = temp_session();
        run_batch(
            &mut session,
            &[URL_A],
            "ignored",
            |video| {
                Ok(SavedThumbnail {
                    video_id: video.video_id.clone(),
                    quality: "hqdefault".into(),
                    path: PathBuf::from("/tmp/a.jpg"),
                })
            },
            |_| {},
        )
        .unwrap();
        run_batch(
            &mut session,
            &[URL_A_SHORT_LINK],
            "ignored",
            |video| {
                Ok(DownloadedVideo {
                    video_id: video.video_id.clone(),
                    title: "Video A".into(),
                    path: PathBuf::from("/tmp/a.mp4"),
                    resolution: Resolution::P720,
                })
            },
            |_| {},
        )
        .unwrap();

        let record = store.load();
        assert_eq!(record.thumbnails["aaaaaaaaaaa"].quality, "hqdefault");
        assert_eq!(record.videos["aaaaaaaaaaa"].resolution, Resolution::P720);
        assert!(record.transcripts.is_empty());
    }

    #[test]
    fn transcribed_url_is_still_downloaded_as_video() {
        use crate::youtube::Resolution;
        use std::path::PathBuf;

        let (_dir, store, mut session) = temp_session();
        let mut fake = FakeTranscripts::new(vec![(
            "aaaaaaaaaaa",
            Ok(transcript("aaaaaaaaaaa", "A")),
        )]);
        run(&mut session, &[URL_A], &mut fake);

        let mut downloads = 0;
        let report = run_batch(
            &mut session,
            &[URL_A],
            "Chan",
            |video| {
                downloads += 1;
                Ok(DownloadedVideo {
                    video_id: video.video_id.clone(),
                    title: "A".into(),
                    path: PathBuf::from("/tmp/a.mp4"),
                    resolution: Resolution::Best,
                })
            },
            |_| {},
        )
        .unwrap();

        assert_eq!(downloads, 1);
        assert_eq!(report.stored, 1);
        let record = store.load();
        assert!(record.videos.contains_key("aaaaaaaaaaa"));
        assert!(record.has_processed("videos", URL_A));
        assert_eq!(record.downloaded_links, vec![URL_A]);
    }

    #[test]
    fn link_skip_is_per_transcript_group() {
        let (_dir, store, mut session) = temp_session();
        let mut fake = FakeTranscripts::new(vec![(
            "aaaaaaaaaaa",
            Ok(transcript("aaaaaaaaaaa", "A")),
        )]);
        run(&mut session, &[URL_A], &mut fake);
        fake.calls.clear();

        let report = run_batch(&mut session, &[URL_A], "Other", |video| fake.fetch(video), |_| {})
            .unwrap();
        assert_eq!(fake.calls, vec!["aaaaaaaaaaa"]);
        assert_eq!(report.stored, 1);
        let record = store.load();
        assert!(record.has_transcript("Chan", "aaaaaaaaaaa"));
        assert!(record.has_transcript("Other", "aaaaaaaaaaa"));
    }
}
