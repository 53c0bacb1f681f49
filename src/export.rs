#![forbid(unsafe_code)]

//! Downloadable renderings of ledger content: TXT, CSV and ZIP.

use std::collections::HashSet;
use std::fs;
use std::io::{Cursor, Write};

use anyhow::{Context, Result};
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::ledger::LedgerRecord;
use crate::sources::ChannelVideo;

pub const CSV_HEADERS: [&str; 3] = ["video_id", "youtube_url", "title"];
const SEPARATOR: &str = "-------------------";

/// Every transcript as `title / url / separator / text`, followed by a blank
/// line. Groups and videos come out in key order. `group` narrows the output
/// to one group.
pub fn transcripts_txt(record: &LedgerRecord, group: Option<&str>) -> String {
    let mut out = String::new();
    for (name, videos) in &record.transcripts {
        if group.is_some_and(|wanted| wanted != name) {
            continue;
        }
        for entry in videos.values() {
            out.push_str(&entry.title);
            out.push('\n');
            out.push_str(&entry.url);
            out.push('\n');
            out.push_str(SEPARATOR);
            out.push('\n');
            out.push_str(&entry.transcript_text);
            out.push_str("\n\n");
        }
    }
    out
}

pub fn channel_csv(videos: &[ChannelVideo]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADERS)?;
    for video in videos {
        writer.write_record([&video.video_id, &video.url, &video.title])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv: {}", err.error()))?;
    String::from_utf8(bytes).context("csv output is not UTF-8")
}

fn zip_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// One `<group>/<video_id>.txt` file per transcript.
pub fn transcripts_zip(record: &LedgerRecord) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let mut segments = HashSet::new();
    for (group, videos) in &record.transcripts {
        let segment = unique_name(&mut segments, archive_segment(group));
        for (video_id, entry) in videos {
            let name = format!("{segment}/{video_id}.txt");
            zip.start_file(name, zip_options())?;
            write!(
                zip,
                "{}\n{}\n{SEPARATOR}\n{}\n",
                entry.title, entry.url, entry.transcript_text
            )?;
        }
    }
    Ok(zip.finish()?.into_inner())
}

/// Every recorded thumbnail still present on disk, stored under its file
/// name. Missing files are skipped.
pub fn thumbnails_zip(record: &LedgerRecord) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (video_id, entry) in &record.thumbnails {
        let Ok(bytes) = fs::read(&entry.path) else {
            tracing::warn!(
                "thumbnail for {video_id} missing at {}",
                entry.path.display()
            );
            continue;
        };
        let name = entry
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{video_id}_{}.jpg", entry.quality));
        // Stored as-is: JPEG does not compress further.
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file(name, options)?;
        zip.write_all(&bytes)?;
    }
    Ok(zip.finish()?.into_inner())
}

/// Returns `base`, or `base (2)`, `base (3)`, ... when already taken.
fn unique_name(taken: &mut HashSet<String>, base: String) -> String {
    let mut candidate = base.clone();
    let mut counter = 2;
    while !taken.insert(candidate.clone()) {
        candidate = format!("{base} ({counter})");
        counter += 1;
    }
    candidate
}

/// Group keys are channel names; keep them usable as a directory name.
fn archive_segment(group: &str) -> String {
    let cleaned: String = group
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ThumbnailEntry, TranscriptEntry};
    use std::io::Read;
    use zip::ZipArchive;

    fn record() -> LedgerRecord {
        let mut record = LedgerRecord::default();
        record.insert_transcript(
            "Chan/One",
            "bbbbbbbbbbb",
            TranscriptEntry {
                title: "Second".into(),
                transcript_text: "two".into(),
                url: "https://youtu.be/bbbbbbbbbbb".into(),
            },
        );
        record.insert_transcript(
            "Chan/One",
            "aaaaaaaaaaa",
            TranscriptEntry {
                title: "First".into(),
                transcript_text: "one".into(),
                url: "https://youtu.be/aaaaaaaaaaa".into(),
            },
        );
        record.insert_transcript(
            "videos",
            "ccccccccccc",
            TranscriptEntry {
                title: "Third".into(),
                transcript_text: "three".into(),
                url: String::new(),
            },
        );
        record
    }

    #[test]
    fn txt_layout() {
        let txt = transcripts_txt(&record(), Some("Chan/One"));
        assert_eq!(
            txt,
            "First\nhttps://youtu.be/aaaaaaaaaaa\n-------------------\none\n\n\
             Second\nhttps://youtu.be/bbbbbbbbbbb\n-------------------\ntwo\n\n"
        );
        assert!(transcripts_txt(&record(), None).contains("Third\n\n-------------------\nthree"));
        assert!(transcripts_txt(&LedgerRecord::default(), None).is_empty());
    }

    #[test]
    fn csv_quotes_titles_with_commas() {
        let csv = channel_csv(&[ChannelVideo {
            video_id: "aaaaaaaaaaa".into(),
            url: "https://www.youtube.com/watch?v=aaaaaaaaaaa".into(),
            title: "Hello, \"world\"".into(),
        }])
        .unwrap();
        assert_eq!(
            csv,
            "video_id,youtube_url,title\n\
             aaaaaaaaaaa,https://www.youtube.com/watch?v=aaaaaaaaaaa,\"Hello, \"\"world\"\"\"\n"
        );
        assert_eq!(channel_csv(&[]).unwrap(), "video_id,youtube_url,title\n");
    }

    #[test]
    fn transcripts_zip_has_one_file_per_video() {
        let bytes = transcripts_zip(&record()).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "Chan_One/aaaaaaaaaaa.txt",
                "Chan_One/bbbbbbbbbbb.txt",
                "videos/ccccccccccc.txt"
            ]
        );

        let mut body = String::new();
        archive
            .by_name("Chan_One/aaaaaaaaaaa.txt")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "First\nhttps://youtu.be/aaaaaaaaaaa\n-------------------\none\n");
    }

    #[test]
    fn groups_with_the_same_safe_name_get_separate_folders() {
        let mut record = LedgerRecord::default();
        for (group, title) in [("News: Daily", "colon"), ("News/ Daily", "slash")] {
            record.insert_transcript(
                group,
                "aaaaaaaaaaa",
                TranscriptEntry {
                    title: title.into(),
                    transcript_text: "t".into(),
                    url: String::new(),
                },
            );
        }

        let bytes = transcripts_zip(&record).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "News_ Daily (2)/aaaaaaaaaaa.txt",
                "News_ Daily/aaaaaaaaaaa.txt"
            ]
        );

        // Groups are visited in key order: '/' sorts before ':'.
        let mut body = String::new();
        archive
            .by_name("News_ Daily (2)/aaaaaaaaaaa.txt")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert!(body.starts_with("colon\n"));
    }

    #[test]
    fn unique_names_count_up() {
        let mut taken = HashSet::new();
        assert_eq!(unique_name(&mut taken, "a".into()), "a");
        assert_eq!(unique_name(&mut taken, "a".into()), "a (2)");
        assert_eq!(unique_name(&mut taken, "a (2)".into()), "a (2) (2)");
        assert_eq!(unique_name(&mut taken, "a".into()), "a (3)");
    }

    #[test]
    fn thumbnails_zip_skips_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("aaaaaaaaaaa_hqdefault.jpg");
        fs::write(&present, b"jpeg").unwrap();

        let mut record = LedgerRecord::default();
        record.thumbnails.insert(
            "aaaaaaaaaaa".into(),
            ThumbnailEntry {
                url: "u1".into(),
                quality: "hqdefault".into(),
                path: present,
            },
        );
        record.thumbnails.insert(
            "bbbbbbbbbbb".into(),
            ThumbnailEntry {
                url: "u2".into(),
                quality: "mqdefault".into(),
                path: dir.path().join("gone.jpg"),
            },
        );

        let bytes = thumbnails_zip(&record).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);
        let mut body = Vec::new();
        archive
            .by_name("aaaaaaaaaaa_hqdefault.jpg")
            .unwrap()
            .read_to_end(&mut body)
            .unwrap();
        assert_eq!(body, b"jpeg");
    }

    #[test]
    fn archive_segments_are_path_safe() {
        assert_eq!(archive_segment("a/b:c"), "a_b_c");
        assert_eq!(archive_segment(".."), "untitled");
        assert_eq!(archive_segment("Plain Name"), "Plain Name");
    }
}
