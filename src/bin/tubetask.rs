#![forbid(unsafe_code)]

//! Command-line front end for the YouTube utilities.
//!
//! Every batch command reads URLs, runs them through the shared ledger and
//! prints one line per item plus a summary. Re-running a command only touches
//! URLs that have not been processed yet.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tubetask_tools::channel::YtDlpChannels;
use tubetask_tools::config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config};
use tubetask_tools::export::{thumbnails_zip, transcripts_txt, transcripts_zip};
use tubetask_tools::input::collect_urls;
use tubetask_tools::ledger::DEFAULT_GROUP;
use tubetask_tools::orchestrator::{BatchProgress, BatchReport};
use tubetask_tools::pipelines::{
    channel_transcripts, list_channel, thumbnails_batch, transcripts_batch, videos_batch,
};
use tubetask_tools::progress::{ProgressWriter, update_progress};
use tubetask_tools::session::Session;
use tubetask_tools::thumbnail::HttpThumbnails;
use tubetask_tools::transcript::YtDlpTranscripts;
use tubetask_tools::video::YtDlpVideos;
use tubetask_tools::youtube::Resolution;

#[derive(Debug, Parser)]
#[command(name = "tubetask", version, about = "Transcripts, thumbnails, videos and channel listings from YouTube")]
struct Cli {
    /// Alternate .env file
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Directory for the ledger, thumbnails and videos
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    /// Ledger JSON file (defaults to <data-root>/state.json)
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    /// yt-dlp executable
    #[arg(long, global = true)]
    yt_dlp: Option<PathBuf>,

    /// Netscape cookie jar offered to yt-dlp when a download fails
    #[arg(long, global = true)]
    cookies: Option<PathBuf>,

    /// Write `{progress, message}` JSON here while a batch runs
    #[arg(long, global = true)]
    progress_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct UrlInput {
    /// Comma-separated URLs
    #[arg(long)]
    urls: Option<String>,

    /// Text file with one URL per line
    #[arg(long, conflicts_with = "urls")]
    file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch transcripts for a list of videos
    Transcripts {
        #[command(flatten)]
        input: UrlInput,

        /// Ledger group the transcripts are stored under
        #[arg(long, default_value = DEFAULT_GROUP)]
        group: String,

        /// Attempts per video on network errors
        #[arg(long)]
        retries: Option<u32>,
    },
    /// Download the best available thumbnail of each video
    Thumbnails {
        #[command(flatten)]
        input: UrlInput,
    },
    /// List a channel's videos as CSV, optionally fetching every transcript
    Channel {
        /// Channel name, @handle, channel id or URL
        name: String,

        /// CSV destination (stdout when omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Also fetch transcripts into the channel's group
        #[arg(long)]
        transcripts: bool,
    },
    /// Download videos as mp4
    Video {
        #[command(flatten)]
        input: UrlInput,

        /// best, 1080, 720 or 360
        #[arg(long, default_value = "best")]
        resolution: Resolution,
    },
    /// Inspect or reset the ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
    /// Write ledger content to a file
    Export {
        #[arg(value_enum)]
        kind: ExportKind,

        /// Destination (stdout for text when omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Only this transcript group (text export)
        #[arg(long)]
        group: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum LedgerAction {
    /// Print the ledger JSON
    Show,
    /// Reset the ledger to its empty shape
    Clear,
    /// List URLs that failed and will be retried
    Failures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExportKind {
    TranscriptsTxt,
    TranscriptsZip,
    ThumbnailsZip,
}

impl Cli {
    fn overrides(&self) -> RuntimeOverrides {
        let retries = match &self.command {
            Command::Transcripts { retries, .. } => *retries,
            _ => None,
        };
        RuntimeOverrides {
            data_root: self.data_root.clone(),
            ledger_path: self.ledger.clone(),
            cookies_path: self.cookies.clone(),
            yt_dlp: self.yt_dlp.clone(),
            transcript_retries: retries,
            env_path: self.env_file.clone(),
            ..RuntimeOverrides::default()
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = resolve_runtime_config(cli.overrides())?;
    let progress = cli.progress_file.clone().map(ProgressWriter::new);
    let mut session = Session::open(config.ledger_store());

    match cli.command {
        Command::Transcripts { input, group, .. } => {
            let urls = read_urls(&input)?;
            config.ytdlp().ensure_available()?;
            let source = YtDlpTranscripts::new(config.ytdlp(), config.transcript_policy());
            let report = transcripts_batch(
                &mut session,
                &source,
                &urls,
                &group,
                print_progress(progress.as_ref()),
            )?;
            finish(&report, progress.as_ref());
        }
        Command::Thumbnails { input } => {
            let urls = read_urls(&input)?;
            let report = thumbnails_batch(
                &mut session,
                &HttpThumbnails::default(),
                &config.thumbnails_dir(),
                &urls,
                print_progress(progress.as_ref()),
            )?;
            finish(&report, progress.as_ref());
            println!("Thumbnails: {}", config.thumbnails_dir().display());
        }
        Command::Channel {
            name,
            output,
            transcripts,
        } => run_channel(&config, &mut session, &name, output.as_deref(), transcripts, progress.as_ref())?,
        Command::Video { input, resolution } => {
            let urls = read_urls(&input)?;
            config.ytdlp().ensure_available()?;
            let downloader = YtDlpVideos::new(config.ytdlp(), config.videos_dir());
            let report = videos_batch(
                &mut session,
                &downloader,
                &urls,
                resolution,
                |done, total| {
                    if let Some(total) = total.filter(|total| *total > 0) {
                        update_progress(
                            progress.as_ref(),
                            ((done * 100) / total).min(100) as u8,
                            "Downloading video",
                        );
                    }
                },
                print_progress(None),
            )?;
            finish(&report, progress.as_ref());
            println!("Videos: {}", config.videos_dir().display());
        }
        Command::Ledger { action } => run_ledger(&mut session, action)?,
        Command::Export {
            kind,
            output,
            group,
        } => run_export(&session, kind, output.as_deref(), group.as_deref())?,
    }

    Ok(())
}

fn read_urls(input: &UrlInput) -> Result<Vec<String>> {
    let urls = collect_urls(input.urls.as_deref(), input.file.as_deref())?;
    if urls.is_empty() {
        bail!("no URLs given; use --urls or --file");
    }
    Ok(urls)
}

/// Per-item line on stdout, mirrored into the progress file when set.
fn print_progress(progress: Option<&ProgressWriter>) -> impl FnMut(&BatchProgress<'_>) + '_ {
    move |step| {
        println!(
            "[{}/{}] {}: {}",
            step.processed,
            step.total,
            step.url,
            step.status.label()
        );
        update_progress(
            progress,
            step.percent(),
            &format!("Processed {} of {}", step.processed, step.total),
        );
    }
}

fn finish(report: &BatchReport, progress: Option<&ProgressWriter>) {
    update_progress(progress, 100, "Batch complete");
    println!();
    println!("{}", report.summary());
    let failed = report.failed_urls();
    if !failed.is_empty() {
        println!("Failed (retried on the next run):");
        for url in failed {
            println!("  - {url}");
        }
    }
}

fn run_channel(
    config: &RuntimeConfig,
    session: &mut Session,
    name: &str,
    output: Option<&Path>,
    with_transcripts: bool,
    progress: Option<&ProgressWriter>,
) -> Result<()> {
    config.ytdlp().ensure_available()?;
    let resolver = YtDlpChannels::new(config.ytdlp());
    update_progress(progress, 0, "Fetching channel list");

    let listing = if with_transcripts {
        let source = YtDlpTranscripts::new(config.ytdlp(), config.transcript_policy());
        let (listing, report) =
            channel_transcripts(session, &resolver, &source, name, print_progress(progress))?;
        finish(&report, progress);
        listing
    } else {
        list_channel(&resolver, name)?
    };

    let csv = listing.to_csv()?;
    match output {
        Some(path) => {
            write_output(path, csv.as_bytes())?;
            println!(
                "{} video(s) of \"{}\" written to {}",
                listing.videos.len(),
                listing.name,
                path.display()
            );
        }
        None => print!("{csv}"),
    }
    Ok(())
}

fn run_ledger(session: &mut Session, action: LedgerAction) -> Result<()> {
    match action {
        LedgerAction::Show => {
            println!("{}", serde_json::to_string_pretty(session.record())?);
        }
        LedgerAction::Clear => {
            session.clear()?;
            println!("Ledger cleared: {}", session.store().path().display());
        }
        LedgerAction::Failures => {
            let failures = &session.record().failed_downloads;
            if failures.is_empty() {
                println!("No failed downloads.");
            }
            for failed in failures {
                println!("{}\t{}\t{}", failed.url, failed.kind, failed.error);
            }
        }
    }
    Ok(())
}

fn run_export(
    session: &Session,
    kind: ExportKind,
    output: Option<&Path>,
    group: Option<&str>,
) -> Result<()> {
    let record = session.record();
    match (kind, output) {
        (ExportKind::TranscriptsTxt, None) => print!("{}", transcripts_txt(record, group)),
        (ExportKind::TranscriptsTxt, Some(path)) => {
            write_output(path, transcripts_txt(record, group).as_bytes())?
        }
        (ExportKind::TranscriptsZip, Some(path)) => write_output(path, &transcripts_zip(record)?)?,
        (ExportKind::ThumbnailsZip, Some(path)) => write_output(path, &thumbnails_zip(record)?)?,
        (_, None) => bail!("zip exports need --output"),
    }
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tubetask_tools::ledger::LedgerStore;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tubetask").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn transcripts_defaults() {
        let cli = parse(&["transcripts", "--urls", "a,b"]);
        match cli.command {
            Command::Transcripts {
                input,
                group,
                retries,
            } => {
                assert_eq!(input.urls.as_deref(), Some("a,b"));
                assert_eq!(group, DEFAULT_GROUP);
                assert_eq!(retries, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn urls_and_file_conflict() {
        let result = Cli::try_parse_from([
            "tubetask",
            "thumbnails",
            "--urls",
            "a",
            "--file",
            "urls.txt",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn resolution_parses_through_from_str() {
        let cli = parse(&["video", "--urls", "a", "--resolution", "720p"]);
        assert!(matches!(
            cli.command,
            Command::Video {
                resolution: Resolution::P720,
                ..
            }
        ));
        assert!(
            Cli::try_parse_from(["tubetask", "video", "--resolution", "4k"]).is_err()
        );
    }

    #[test]
    fn global_flags_feed_overrides() {
        let cli = parse(&[
            "--data-root",
            "/tmp/tube",
            "transcripts",
            "--retries",
            "2",
            "--file",
            "urls.txt",
        ]);
        let overrides = cli.overrides();
        assert_eq!(overrides.data_root, Some(PathBuf::from("/tmp/tube")));
        assert_eq!(overrides.transcript_retries, Some(2));
    }

    #[test]
    fn export_kinds() {
        let cli = parse(&["export", "transcripts-zip", "-o", "out.zip"]);
        assert!(matches!(
            cli.command,
            Command::Export {
                kind: ExportKind::TranscriptsZip,
                ..
            }
        ));
    }

    #[test]
    fn zip_export_requires_output() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::open(LedgerStore::new(dir.path().join("state.json")));
        assert!(run_export(&session, ExportKind::ThumbnailsZip, None, None).is_err());

        let out = dir.path().join("out").join("t.zip");
        run_export(&session, ExportKind::TranscriptsZip, Some(&out), None).unwrap();
        assert!(out.exists());
    }

    #[test]
    fn ledger_clear_resets_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("state.json"));
        let mut session = Session::open(store.clone());
        session.update(|record| record.push_link("x")).unwrap();

        run_ledger(&mut session, LedgerAction::Clear).unwrap();
        assert!(store.load().is_empty());
    }
}
