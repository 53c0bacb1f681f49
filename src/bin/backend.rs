#![forbid(unsafe_code)]

//! Control panel API.
//!
//! Batch requests return a job id immediately; the batch itself runs on a
//! blocking thread while holding the ledger lock, so at most one batch writes
//! the ledger at a time. Reads never take the lock: the ledger file is always
//! replaced atomically, so a reader sees either the old or the new document.

use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tubetask_tools::channel::YtDlpChannels;
use tubetask_tools::config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config};
use tubetask_tools::error::{FailureKind, FetchError};
use tubetask_tools::export::{thumbnails_zip, transcripts_txt, transcripts_zip};
use tubetask_tools::input::normalize_urls;
use tubetask_tools::ledger::{DEFAULT_GROUP, LedgerRecord};
use tubetask_tools::orchestrator::{BatchProgress, BatchReport};
use tubetask_tools::pipelines::{
    channel_transcripts, list_channel, thumbnails_batch, transcripts_batch, videos_batch,
};
use tubetask_tools::session::Session;
use tubetask_tools::sources::{ChannelResolver, ThumbnailSource, TranscriptSource, VideoDownloader};
use tubetask_tools::thumbnail::HttpThumbnails;
use tubetask_tools::transcript::YtDlpTranscripts;
use tubetask_tools::video::YtDlpVideos;
use tubetask_tools::youtube::{Resolution, is_valid_video_id};

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Control panel API for the YouTube utilities")]
struct BackendArgs {
    /// Alternate .env file
    #[arg(long)]
    env_file: Option<PathBuf>,

    #[arg(long)]
    data_root: Option<PathBuf>,

    #[arg(long)]
    ledger: Option<PathBuf>,

    #[arg(long)]
    yt_dlp: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

impl BackendArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            data_root: self.data_root.clone(),
            ledger_path: self.ledger.clone(),
            yt_dlp: self.yt_dlp.clone(),
            port: self.port,
            host: self.host.clone(),
            env_path: self.env_file.clone(),
            ..RuntimeOverrides::default()
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBETASK_HOST")
}

/// External collaborators, swappable in tests.
#[derive(Clone)]
struct Sources {
    transcripts: Arc<dyn TranscriptSource>,
    thumbnails: Arc<dyn ThumbnailSource>,
    videos: Arc<dyn VideoDownloader>,
    channels: Arc<dyn ChannelResolver>,
}

impl Sources {
    fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            transcripts: Arc::new(YtDlpTranscripts::new(
                config.ytdlp(),
                config.transcript_policy(),
            )),
            thumbnails: Arc::new(HttpThumbnails::default()),
            videos: Arc::new(YtDlpVideos::new(config.ytdlp(), config.videos_dir())),
            channels: Arc::new(YtDlpChannels::new(config.ytdlp())),
        }
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<RuntimeConfig>,
    sources: Sources,
    jobs: JobManager,
    ledger_lock: Arc<Mutex<()>>,
}

impl AppState {
    fn new(config: RuntimeConfig, sources: Sources) -> Self {
        Self {
            config: Arc::new(config),
            sources,
            jobs: JobManager::new(),
            ledger_lock: Arc::new(Mutex::new(())),
        }
    }

    fn load_record(&self) -> LedgerRecord {
        self.config.ledger_store().load()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum JobKind {
    Transcripts,
    Thumbnails,
    Videos,
    ChannelTranscripts,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    id: String,
    kind: JobKind,
    status: JobStatus,
    progress: u8,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<BatchReport>,
}

#[derive(Clone)]
struct JobManager {
    inner: Arc<JobManagerInner>,
}

/// Finished jobs kept for polling; older ones are evicted first.
const MAX_FINISHED_JOBS: usize = 200;

struct JobManagerInner {
    jobs: Mutex<HashMap<String, Job>>,
    /// Ids of completed or failed jobs, oldest first.
    finished: Mutex<VecDeque<String>>,
    max_finished: usize,
    counter: AtomicUsize,
}

/// Handle given to a running batch for reporting back into its job entry.
#[derive(Clone)]
struct JobProgress {
    inner: Arc<JobManagerInner>,
    id: String,
}

impl JobProgress {
    fn update(&self, mutate: impl FnOnce(&mut Job)) {
        if let Some(job) = self.inner.jobs.lock().get_mut(&self.id) {
            mutate(job);
        }
    }

    fn step(&self, step: &BatchProgress<'_>) {
        let message = format!(
            "Processed {} of {}: {} ({})",
            step.processed,
            step.total,
            step.url,
            step.status.label()
        );
        let percent = step.percent();
        self.update(|job| {
            job.progress = percent;
            job.message = message;
        });
    }

    fn message(&self, message: &str) {
        self.update(|job| job.message = message.to_string());
    }

    fn retire(&self) {
        let mut finished = self.inner.finished.lock();
        finished.push_back(self.id.clone());
        while finished.len() > self.inner.max_finished {
            if let Some(oldest) = finished.pop_front() {
                self.inner.jobs.lock().remove(&oldest);
            }
        }
    }
}

impl JobManager {
    fn new() -> Self {
        Self::with_capacity(MAX_FINISHED_JOBS)
    }

    fn with_capacity(max_finished: usize) -> Self {
        Self {
            inner: Arc::new(JobManagerInner {
                jobs: Mutex::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                max_finished,
                counter: AtomicUsize::new(1),
            }),
        }
    }

    /// Registers a job and runs `work` on the blocking pool.
    fn start<F>(&self, kind: JobKind, work: F) -> String
    where
        F: FnOnce(&JobProgress) -> Result<BatchReport> + Send + 'static,
    {
        let id = self.next_job_id();
        self.inner.jobs.lock().insert(
            id.clone(),
            Job {
                id: id.clone(),
                kind,
                status: JobStatus::Queued,
                progress: 0,
                message: "Queued".to_string(),
                report: None,
            },
        );

        let handle = JobProgress {
            inner: self.inner.clone(),
            id: id.clone(),
        };
        tokio::spawn(async move {
            handle.update(|job| {
                job.status = JobStatus::Running;
                job.message = "Running".to_string();
            });
            let runner = handle.clone();
            let outcome = tokio::task::spawn_blocking(move || work(&runner)).await;

            match outcome {
                Ok(Ok(report)) => {
                    info!("job {} finished: {}", handle.id, report.summary());
                    handle.update(|job| {
                        job.status = JobStatus::Completed;
                        job.progress = 100;
                        job.message = report.summary();
                        job.report = Some(report);
                    });
                }
                Ok(Err(err)) => fail_job(&handle, &format!("{err:#}")),
                Err(err) => fail_job(&handle, &err.to_string()),
            }
            handle.retire();
        });

        id
    }

    fn get(&self, id: &str) -> Option<Job> {
        self.inner.jobs.lock().get(id).cloned()
    }

    fn next_job_id(&self) -> String {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        format!("job-{id}")
    }
}

fn fail_job(handle: &JobProgress, error: &str) {
    warn!("job {} failed: {error}", handle.id);
    handle.update(|job| {
        job.status = JobStatus::Failed;
        job.progress = 100;
        job.message = format!("Failed: {error}");
    });
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let status = match err.kind {
            FailureKind::NotFound => StatusCode::NOT_FOUND,
            FailureKind::InvalidInput => StatusCode::BAD_REQUEST,
            FailureKind::Disabled => StatusCode::UNPROCESSABLE_ENTITY,
            FailureKind::NetworkError => StatusCode::BAD_GATEWAY,
            FailureKind::Unexpected => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<FetchError>() {
            Ok(fetch) => fetch.into(),
            Err(err) => Self::internal(format!("{err:#}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = BackendArgs::parse();
    let config = resolve_runtime_config(args.overrides())?;
    let host = parse_host_arg(&config.host)?;
    let addr = SocketAddr::new(host, config.port);

    if let Err(err) = config.ytdlp().ensure_available() {
        warn!("{err:#}; transcript, channel and video jobs will fail");
    }
    info!("ledger at {}", config.ledger_path.display());

    let state = AppState::new(config.clone(), Sources::from_config(&config));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ledger", get(get_ledger).delete(clear_ledger))
        .route("/api/transcripts", post(start_transcripts))
        .route("/api/thumbnails", post(start_thumbnails))
        .route("/api/videos", post(start_videos))
        .route("/api/videos/{id}/file", get(stream_video_file))
        .route("/api/channels/{name}/videos.csv", get(channel_videos_csv))
        .route("/api/channels/{name}/transcripts", post(start_channel_transcripts))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/exports/transcripts.txt", get(export_transcripts_txt))
        .route("/api/exports/transcripts.zip", get(export_transcripts_zip))
        .route("/api/exports/thumbnails.zip", get(export_thumbnails_zip))
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}

/// Runs blocking work (file IO, yt-dlp) off the async executor.
async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ApiResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ApiError::internal(format!("worker panicked: {err}")))?
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    /// Comma- or newline-separated URLs.
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    urls: Option<Vec<String>>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    resolution: Option<Resolution>,
}

impl BatchRequest {
    fn collect_urls(&self) -> ApiResult<Vec<String>> {
        let listed = self
            .urls
            .as_ref()
            .filter(|urls| !urls.is_empty())
            .map(|urls| urls.join("\n"));
        let urls = normalize_urls(self.text.as_deref(), listed.as_deref())?;
        if urls.is_empty() {
            return Err(ApiError::bad_request("no URLs given"));
        }
        Ok(urls)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobResponse {
    id: String,
}

async fn get_ledger(State(state): State<AppState>) -> ApiResult<Json<LedgerRecord>> {
    blocking(move || Ok(state.load_record())).await.map(Json)
}

async fn clear_ledger(State(state): State<AppState>) -> ApiResult<Json<LedgerRecord>> {
    let record = blocking(move || {
        let Some(_guard) = state.ledger_lock.try_lock() else {
            return Err(ApiError::conflict(
                "a batch is running; try again when it finishes",
            ));
        };
        Ok(state.config.ledger_store().clear()?)
    })
    .await?;
    info!("ledger cleared");
    Ok(Json(record))
}

async fn start_transcripts(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<Json<JobResponse>> {
    let urls = request.collect_urls()?;
    let group = request
        .group
        .map(|group| group.trim().to_string())
        .filter(|group| !group.is_empty())
        .unwrap_or_else(|| DEFAULT_GROUP.to_string());

    let worker = state.clone();
    let id = state.jobs.start(JobKind::Transcripts, move |progress| {
        let _guard = worker.ledger_lock.lock();
        let mut session = Session::open(worker.config.ledger_store());
        transcripts_batch(
            &mut session,
            worker.sources.transcripts.as_ref(),
            &urls,
            &group,
            |step| progress.step(step),
        )
    });
    Ok(Json(JobResponse { id }))
}

async fn start_thumbnails(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<Json<JobResponse>> {
    let urls = request.collect_urls()?;
    let worker = state.clone();
    let id = state.jobs.start(JobKind::Thumbnails, move |progress| {
        let _guard = worker.ledger_lock.lock();
        let mut session = Session::open(worker.config.ledger_store());
        thumbnails_batch(
            &mut session,
            worker.sources.thumbnails.as_ref(),
            &worker.config.thumbnails_dir(),
            &urls,
            |step| progress.step(step),
        )
    });
    Ok(Json(JobResponse { id }))
}

async fn start_videos(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<Json<JobResponse>> {
    let urls = request.collect_urls()?;
    let resolution = request.resolution.unwrap_or_default();
    let worker = state.clone();
    let id = state.jobs.start(JobKind::Videos, move |progress| {
        let _guard = worker.ledger_lock.lock();
        let mut session = Session::open(worker.config.ledger_store());
        videos_batch(
            &mut session,
            worker.sources.videos.as_ref(),
            &urls,
            resolution,
            |done, total| {
                if let Some(total) = total {
                    progress.message(&format!("Downloading: {done} of {total} bytes"));
                }
            },
            |step| progress.step(step),
        )
    });
    Ok(Json(JobResponse { id }))
}

async fn start_channel_transcripts(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<Json<JobResponse>> {
    let worker = state.clone();
    let id = state.jobs.start(JobKind::ChannelTranscripts, move |progress| {
        progress.message("Fetching channel list");
        let _guard = worker.ledger_lock.lock();
        let mut session = Session::open(worker.config.ledger_store());
        let (_, report) = channel_transcripts(
            &mut session,
            worker.sources.channels.as_ref(),
            worker.sources.transcripts.as_ref(),
            &name,
            |step| progress.step(step),
        )?;
        Ok(report)
    });
    Ok(Json(JobResponse { id }))
}

async fn get_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Job>> {
    state
        .jobs
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("job not found"))
}

fn attachment(content_type: &'static str, filename: &str, body: impl Into<Body>) -> Response {
    let mut response = Response::new(body.into());
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

async fn channel_videos_csv(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<Response> {
    let resolver = state.sources.channels.clone();
    let listing = blocking(move || Ok(list_channel(resolver.as_ref(), &name)?)).await?;
    let csv = listing.to_csv()?;
    let filename = format!("{}_videos.csv", file_stem(&listing.name));
    Ok(attachment("text/csv; charset=utf-8", &filename, csv))
}

/// Channel names become download file names; keep them to a safe subset.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
        .collect();
    if stem.trim_matches('_').is_empty() {
        "channel".to_string()
    } else {
        stem
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExportQuery {
    group: Option<String>,
}

async fn export_transcripts_txt(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let text = blocking(move || {
        let record = state.load_record();
        Ok(transcripts_txt(&record, query.group.as_deref()))
    })
    .await?;
    Ok(attachment("text/plain; charset=utf-8", "transcripts.txt", text))
}

async fn export_transcripts_zip(State(state): State<AppState>) -> ApiResult<Response> {
    let bytes = blocking(move || Ok(transcripts_zip(&state.load_record())?)).await?;
    Ok(attachment("application/zip", "transcripts.zip", bytes))
}

async fn export_thumbnails_zip(State(state): State<AppState>) -> ApiResult<Response> {
    let bytes = blocking(move || Ok(thumbnails_zip(&state.load_record())?)).await?;
    Ok(attachment("application/zip", "thumbnails.zip", bytes))
}

async fn stream_video_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !is_valid_video_id(&id) {
        return Err(ApiError::not_found("video not found"));
    }
    let path = blocking(move || {
        state
            .load_record()
            .videos
            .remove(&id)
            .map(|entry| entry.path)
            .ok_or_else(|| ApiError::not_found("video not found"))
    })
    .await?;
    stream_file(path, &headers).await
}

/// Streams a file from disk, honouring a single `Range` header.
async fn stream_file(path: PathBuf, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return Ok(response);
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let mut response = Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => Body::from_stream(ReaderStream::new(file)).into_response(),
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let range = value.to_str().ok()?.trim().strip_prefix("bytes=")?.trim();
    let (start, end) = range.split_once('-')?;

    if start.is_empty() {
        // "-N": the last N bytes.
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix), size.saturating_sub(1)));
    }

    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        size.saturating_sub(1)
    } else {
        end.parse().ok()?
    };
    (end >= start).then_some((start, end))
}
