#![forbid(unsafe_code)]

//! Thin wrapper around the `yt-dlp` executable.
//!
//! Only the JSON fields this crate reads are modelled; everything is optional
//! because yt-dlp omits keys freely depending on the extractor and video age.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use anyhow::{Result, bail};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{FailureKind, FetchError, FetchResult};

pub const DEFAULT_YT_DLP: &str = "yt-dlp";

/// Stderr fragments that mean the video itself is gone or inaccessible.
const NOT_FOUND_MARKERS: &[&str] = &[
    "video unavailable",
    "private video",
    "has been removed",
    "does not exist",
    "this video is not available",
    "http error 404",
    "this channel does not exist",
];

/// The video exists but not in the requested format. Checked before the
/// not-found markers; another resolution may still succeed.
const FORMAT_MARKERS: &[&str] = &["requested format is not available"];

#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    cookies: Option<PathBuf>,
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new(DEFAULT_YT_DLP)
    }
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies: None,
        }
    }

    /// Cookie jar offered to commands that opt into it.
    pub fn with_cookies(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookies = Some(path.into());
        self
    }

    pub fn cookies(&self) -> Option<&Path> {
        self.cookies.as_deref()
    }

    pub fn command(&self) -> Command {
        Command::new(&self.program)
    }

    /// Runs `<yt-dlp> --version` to fail loudly when the binary is missing.
    pub fn ensure_available(&self) -> Result<()> {
        let status = self
            .command()
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!(
                "{} is installed but returned a failure status",
                self.program.display()
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.program.display(),
                err
            ),
        }
    }

    /// `--dump-single-json` for one video, without downloading media.
    pub fn fetch_info(&self, video_url: &str) -> FetchResult<VideoInfo> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(video_url);
        run_json(command, video_url)
    }

    /// Flat listing of a playlist-like target (channel tab, `ytsearchN:` query).
    pub fn flat_playlist(&self, target: &str) -> FetchResult<FlatPlaylist> {
        let mut command = self.command();
        command
            .arg("--flat-playlist")
            .arg("--dump-single-json")
            .arg("--ignore-errors")
            .arg("--no-warnings")
            .arg(target);
        run_json(command, target)
    }
}

fn run_json<T: DeserializeOwned>(mut command: Command, target: &str) -> FetchResult<T> {
    debug!("running yt-dlp for {target}");
    let output = command
        .stdin(Stdio::null())
        .output()
        .map_err(|err| FetchError::unexpected(format!("launching yt-dlp for {target}: {err}")))?;
    check_status(&output, target)?;

    serde_json::from_slice(&output.stdout).map_err(|err| {
        FetchError::unexpected(format!("parsing yt-dlp JSON for {target}: {err}"))
    })
}

/// Maps a non-zero exit into a typed failure using the captured stderr.
pub fn check_status(output: &Output, target: &str) -> FetchResult<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = last_error_line(&stderr).unwrap_or("no error output");
    Err(FetchError::new(
        classify_stderr(&stderr),
        format!("yt-dlp failed for {target} ({}): {detail}", output.status),
    ))
}

pub fn classify_stderr(stderr: &str) -> FailureKind {
    let lowered = stderr.to_ascii_lowercase();
    if FORMAT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return FailureKind::Unexpected;
    }
    if NOT_FOUND_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        FailureKind::NotFound
    } else {
        FailureKind::NetworkError
    }
}

fn last_error_line(stderr: &str) -> Option<&str> {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("ERROR"))
        .or_else(|| stderr.lines().map(str::trim).rfind(|line| !line.is_empty()))
}

/// Subset of `yt-dlp --dump-single-json` for a single video.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub fulltitle: Option<String>,
    pub channel: Option<String>,
    pub channel_id: Option<String>,
    #[serde(default)]
    pub subtitles: HashMap<String, Vec<CaptionFormat>>,
    #[serde(default)]
    pub automatic_captions: HashMap<String, Vec<CaptionFormat>>,
}

impl VideoInfo {
    /// Human title, falling back to `Video <id>`.
    pub fn display_title(&self, video_id: &str) -> String {
        self.title
            .as_deref()
            .or(self.fulltitle.as_deref())
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Video {video_id}"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptionFormat {
    pub ext: Option<String>,
    pub url: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlatPlaylist {
    pub id: Option<String>,
    pub channel_id: Option<String>,
    #[serde(default)]
    pub entries: Vec<FlatEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlatEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub channel_id: Option<String>,
}

/// Writes an executable bash script standing in for yt-dlp.
#[cfg(all(test, unix))]
pub(crate) fn install_stub(dir: &Path, body: &str) -> std::io::Result<PathBuf> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let script_path = dir.join("yt-dlp");
    fs::write(&script_path, format!("#!/usr/bin/env bash\nset -u\n{body}\n"))?;
    let mut perms = fs::metadata(&script_path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms)?;
    Ok(script_path)
}
