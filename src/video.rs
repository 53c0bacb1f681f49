#![forbid(unsafe_code)]

//! Video downloads through yt-dlp with line-based progress reporting.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::thread;

use tracing::{debug, info, warn};

use crate::cookies::inspect_cookie_file;
use crate::error::{FetchError, FetchResult};
use crate::sources::{ByteProgress, DownloadedVideo, VideoDownloader};
use crate::youtube::{Resolution, VideoRef};
use crate::ytdlp::{YtDlp, classify_stderr};

const PROGRESS_MARKER: &str = "tubetask-progress";
const FILE_MARKER: &str = "tubetask-file";
const TITLE_MARKER: &str = "tubetask-title";

/// One line of stdout emitted by the download command.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadLine {
    Progress { downloaded: u64, total: Option<u64> },
    File(PathBuf),
    Title(String),
}

/// Recognises the marker lines produced by [`download_args`]. yt-dlp prints
/// `NA` for unknown numbers; totals fall back to the size estimate.
pub fn parse_download_line(line: &str) -> Option<DownloadLine> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (marker, rest) = line.split_once(' ')?;
    match marker {
        PROGRESS_MARKER => {
            let mut fields = rest.split_whitespace();
            let downloaded = parse_byte_count(fields.next()?)?;
            let total = fields.next().and_then(parse_byte_count);
            let estimate = fields.next().and_then(parse_byte_count);
            Some(DownloadLine::Progress {
                downloaded,
                total: total.or(estimate),
            })
        }
        FILE_MARKER if !rest.trim().is_empty() => Some(DownloadLine::File(PathBuf::from(rest.trim()))),
        TITLE_MARKER => Some(DownloadLine::Title(rest.trim().to_string())),
        _ => None,
    }
}

fn parse_byte_count(value: &str) -> Option<u64> {
    if value == "NA" {
        return None;
    }
    value
        .parse::<u64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64))
}

pub fn download_args(
    video_url: &str,
    output_dir: &Path,
    resolution: Resolution,
    cookies: Option<&Path>,
) -> Vec<String> {
    let mut args = vec![
        "-f".to_string(),
        resolution.format_selector().to_string(),
        "--merge-output-format".to_string(),
        "mp4".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--newline".to_string(),
        "--progress".to_string(),
        "--progress-template".to_string(),
        format!(
            "download:{PROGRESS_MARKER} %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s"
        ),
        "--print".to_string(),
        format!("after_move:{TITLE_MARKER} %(title)s"),
        "--print".to_string(),
        format!("after_move:{FILE_MARKER} %(filepath)s"),
        "-o".to_string(),
        output_dir
            .join("%(id)s.%(ext)s")
            .to_string_lossy()
            .into_owned(),
    ];
    if let Some(cookies) = cookies {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }
    args.push(video_url.to_string());
    args
}

#[derive(Debug, Clone)]
pub struct YtDlpVideos {
    ytdlp: YtDlp,
    output_dir: PathBuf,
}

impl YtDlpVideos {
    pub fn new(ytdlp: YtDlp, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            ytdlp,
            output_dir: output_dir.into(),
        }
    }

    fn usable_cookies(&self) -> Option<&Path> {
        let path = self.ytdlp.cookies()?;
        let status = inspect_cookie_file(path);
        if status.usable() {
            Some(path)
        } else {
            debug!(
                "cookie jar {} has no live cookies ({} of {} expired)",
                path.display(),
                status.expired,
                status.total
            );
            None
        }
    }

    fn attempt(
        &self,
        video: &VideoRef,
        resolution: Resolution,
        cookies: Option<&Path>,
        progress: ByteProgress<'_>,
    ) -> FetchResult<DownloadedVideo> {
        std::fs::create_dir_all(&self.output_dir)?;
        let target = video.url();
        let mut child = self
            .ytdlp
            .command()
            .args(download_args(&target, &self.output_dir, resolution, cookies))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| FetchError::unexpected(format!("launching yt-dlp: {err}")))?;

        let stderr = child.stderr.take();
        let stderr_reader = thread::spawn(move || {
            let mut captured = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut captured);
            }
            captured
        });

        let mut file = None;
        let mut title = None;
        let mut read_error = None;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        read_error = Some(err);
                        break;
                    }
                };
                match parse_download_line(&line) {
                    Some(DownloadLine::Progress { downloaded, total }) => {
                        progress(downloaded, total)
                    }
                    Some(DownloadLine::File(path)) => file = Some(path),
                    Some(DownloadLine::Title(value)) => title = Some(value),
                    None => {}
                }
            }
        }

        if let Some(err) = read_error {
            if let Err(kill_err) = child.kill() {
                debug!("could not stop yt-dlp for {target}: {kill_err}");
            }
            child.wait()?;
            let _ = stderr_reader.join();
            return Err(FetchError::unexpected(format!(
                "reading yt-dlp output for {target}: {err}"
            )));
        }

        let status = child.wait()?;
        let stderr = stderr_reader.join().unwrap_or_default();
        if !status.success() {
            let detail = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no error output");
            return Err(FetchError::new(
                classify_stderr(&stderr),
                format!("yt-dlp download failed for {target} ({status}): {detail}"),
            ));
        }

        let path = match file {
            Some(path) => path,
            None => {
                let fallback = self.output_dir.join(format!("{}.mp4", video.video_id));
                if !fallback.exists() {
                    return Err(FetchError::unexpected(format!(
                        "yt-dlp finished but no file was reported for {target}"
                    )));
                }
                fallback
            }
        };

        let title = title
            .filter(|title| !title.is_empty() && title != "NA")
            .unwrap_or_else(|| format!("Video {}", video.video_id));
        Ok(DownloadedVideo {
            video_id: video.video_id.clone(),
            title,
            path,
            resolution,
        })
    }
}

impl VideoDownloader for YtDlpVideos {
    fn fetch_video(
        &self,
        video: &VideoRef,
        resolution: Resolution,
        progress: ByteProgress<'_>,
    ) -> FetchResult<DownloadedVideo> {
        let first = match self.attempt(video, resolution, None, &mut *progress) {
            Ok(downloaded) => {
                info!("downloaded {} to {}", video, downloaded.path.display());
                return Ok(downloaded);
            }
            Err(err) => err,
        };

        let Some(cookies) = self.usable_cookies() else {
            return Err(first);
        };
        warn!("download of {video} failed ({first}); retrying with cookies");
        self.attempt(video, resolution, Some(cookies), progress)
    }
}
