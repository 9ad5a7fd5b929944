use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::SecondsFormat;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use vodkit_core::{
    load_vodkit_config, Broker, BulkEnqueueReport, BulkEnqueueRequest, BulkOutcome,
    CacheBackend, CommandExecutor, DispatchMode, EnqueueResult, HealReport, HealRequest,
    IndexOutcome, JobRecord, JobReport, JobStatus, NewVideo, PruneReport, ScheduleOutcome,
    SystemCommandExecutor, TranscodeContext, VideoId, VideoScope, VodkitConfig,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vodkit_core::ConfigError),
    #[error("{0}")]
    Transcode(#[from] vodkit_core::TranscodeError),
    #[error("index error: {0}")]
    Index(#[from] vodkit_core::IndexError),
    #[error("broker error: {0}")]
    Broker(#[from] vodkit_core::BrokerError),
    #[error("store error: {0}")]
    Store(#[from] vodkit_core::StoreError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "vodkit transcode control interface", long_about = None)]
pub struct Cli {
    /// Path to vodkit.toml
    #[arg(long, default_value = "configs/vodkit.toml")]
    pub config: PathBuf,
    /// Overrides paths.media_root
    #[arg(long)]
    pub media_root: Option<PathBuf>,
    /// Overrides paths.data_dir
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Overrides dispatch.mode
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,
    /// Skip retry backoff sleeps
    #[arg(long, default_value_t = false)]
    pub fast: bool,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Inline,
    Broker,
}

impl From<ModeArg> for DispatchMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Inline => DispatchMode::Inline,
            ModeArg::Broker => DispatchMode::Broker,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Transcode state of one video
    Status(VideoArgs),
    /// Requests renditions for a video
    Enqueue(EnqueueArgs),
    /// Requests missing renditions for many videos
    EnqueueMissing(EnqueueMissingArgs),
    /// Picks and schedules the default renditions for a video
    Autotranscode(AutotranscodeArgs),
    /// Mirrors one rendition from disk into the database
    Index(IndexArgs),
    /// Audits disk against the database, repairing with --write
    Heal(HealArgs),
    /// Lists rendition directories of deleted videos, removing them with --confirm
    Prune(PruneArgs),
    /// Drains the transcode queue
    Worker(WorkerArgs),
    /// Maps a public id to a video id
    Resolve(ResolveArgs),
    /// Transcode job queue
    #[command(subcommand)]
    Jobs(JobsCommands),
    /// Video catalog
    #[command(subcommand)]
    Video(VideoCommands),
    /// Checks binaries, directories and databases
    Health,
}

#[derive(Args, Debug)]
pub struct VideoArgs {
    pub video_id: VideoId,
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    pub video_id: VideoId,
    /// Rendition labels; every catalog profile when omitted
    #[arg(long = "resolution", short = 'r', value_delimiter = ',')]
    pub resolutions: Vec<String>,
    /// Re-encode even when renditions exist
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct EnqueueMissingArgs {
    /// Limit to these videos; every known video when omitted
    #[arg(long = "video", value_delimiter = ',')]
    pub videos: Vec<VideoId>,
    #[arg(long = "resolution", short = 'r', value_delimiter = ',')]
    pub resolutions: Vec<String>,
    /// Report what would be requested without requesting it
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
    /// Rebuild renditions that already exist
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct AutotranscodeArgs {
    pub video_id: VideoId,
    /// Ignore the debounce window
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct IndexArgs {
    pub video_id: VideoId,
    pub resolution: String,
}

#[derive(Args, Debug)]
pub struct HealArgs {
    /// Limit to these videos; every known video when omitted
    #[arg(long = "video", value_delimiter = ',')]
    pub videos: Vec<VideoId>,
    #[arg(long = "resolution", short = 'r', value_delimiter = ',')]
    pub resolutions: Vec<String>,
    /// Apply the repairs instead of reporting them
    #[arg(long, default_value_t = false)]
    pub write: bool,
    #[arg(long, default_value_t = false)]
    pub rebuild_master: bool,
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    #[arg(long, default_value_t = false)]
    pub confirm: bool,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Exit once the queue is empty
    #[arg(long, default_value_t = false)]
    pub burst: bool,
    /// Poll interval in milliseconds (dispatch.worker_poll_ms by default)
    #[arg(long)]
    pub poll_ms: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    pub public_id: i64,
    /// Viewer whose unpublished videos are visible
    #[arg(long)]
    pub user_id: Option<i64>,
    /// Resolve against every video, published or not
    #[arg(long, default_value_t = false)]
    pub all: bool,
}

#[derive(Subcommand, Debug)]
pub enum JobsCommands {
    /// Lists queued and finished jobs
    List(JobsListArgs),
}

#[derive(Args, Debug)]
pub struct JobsListArgs {
    /// queued, started, finished or failed
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum VideoCommands {
    /// Registers a video and optionally its uploaded source
    Add(VideoAddArgs),
}

#[derive(Args, Debug)]
pub struct VideoAddArgs {
    #[arg(long)]
    pub title: String,
    #[arg(long, default_value = "")]
    pub description: String,
    #[arg(long)]
    pub owner_id: Option<i64>,
    #[arg(long, default_value_t = false)]
    pub published: bool,
    /// Source file copied into the upload location
    #[arg(long)]
    pub source: Option<PathBuf>,
    /// Schedule default renditions once the source is in place
    #[arg(long, default_value_t = false)]
    pub autotranscode: bool,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Status(args) => {
            let report = context.video_status(args.video_id).await?;
            render(&report, cli.format)?;
        }
        Commands::Enqueue(args) => {
            let result = context.enqueue(args).await?;
            render(&result, cli.format)?;
        }
        Commands::EnqueueMissing(args) => {
            let report = context.enqueue_missing(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Autotranscode(args) => {
            let outcome = context
                .ctx
                .autotranscoder
                .schedule_default_renditions(args.video_id, args.force)
                .await;
            render(&outcome, cli.format)?;
        }
        Commands::Index(args) => {
            let outcome = context
                .ctx
                .indexer
                .reconcile_forced(args.video_id, &args.resolution)
                .await?;
            render(&outcome, cli.format)?;
        }
        Commands::Heal(args) => {
            let report = context.heal(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Prune(args) => {
            let report = context.ctx.indexer.prune_orphans(args.confirm).await?;
            render(&report, cli.format)?;
        }
        Commands::Worker(args) => {
            let reports = context.run_worker(args).await?;
            render(&reports, cli.format)?;
        }
        Commands::Resolve(args) => {
            let resolved = context.resolve(args)?;
            render(&resolved, cli.format)?;
        }
        Commands::Jobs(JobsCommands::List(args)) => {
            let jobs = context.job_list(args)?;
            render(&jobs, cli.format)?;
        }
        Commands::Video(VideoCommands::Add(args)) => {
            let added = context.video_add(args).await?;
            render(&added, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check().await;
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more health checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config_path: PathBuf,
    ctx: TranscodeContext,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut config = load_vodkit_config(&config_path)?;
        apply_overrides(&mut config, cli);
        let ctx = TranscodeContext::open(config)?;
        Ok(Self { config_path, ctx })
    }

    fn config(&self) -> &VodkitConfig {
        &self.ctx.config
    }

    async fn video_status(&self, video_id: VideoId) -> Result<VideoStatusReport> {
        let dispatcher = &self.ctx.dispatcher;
        let status = dispatcher.status(video_id).await?;
        let ready = self
            .ctx
            .renditions
            .ready_profiles(video_id)
            .await
            .into_iter()
            .map(|profile| profile.label.to_string())
            .collect();
        Ok(VideoStatusReport {
            video_id,
            state: status.state.to_string(),
            message: status.message,
            locked: dispatcher.is_locked(video_id)?,
            pending: dispatcher
                .state()
                .pending
                .is_pending(video_id)
                .map_err(vodkit_core::TranscodeError::from)?,
            ready,
        })
    }

    async fn enqueue(&self, args: &EnqueueArgs) -> Result<EnqueueResult> {
        let dispatcher = &self.ctx.dispatcher;
        let result = if args.force {
            dispatcher.rebuild(args.video_id, &args.resolutions).await?
        } else {
            dispatcher.enqueue(args.video_id, &args.resolutions).await?
        };
        Ok(result)
    }

    async fn enqueue_missing(&self, args: &EnqueueMissingArgs) -> Result<BulkEnqueueReport> {
        let videos = if args.videos.is_empty() {
            self.ctx.database.list_video_ids(VideoScope::All)?
        } else {
            args.videos.clone()
        };
        let request = BulkEnqueueRequest {
            videos,
            resolutions: args.resolutions.clone(),
            dry_run: args.dry_run,
            force: args.force,
        };
        Ok(self.ctx.dispatcher.enqueue_missing(&request).await?)
    }

    async fn heal(&self, args: &HealArgs) -> Result<HealReport> {
        let request = HealRequest {
            videos: (!args.videos.is_empty()).then(|| args.videos.clone()),
            resolutions: args.resolutions.clone(),
            write: args.write,
            rebuild_master: args.rebuild_master,
        };
        Ok(self.ctx.indexer.heal(&request).await?)
    }

    async fn run_worker(&self, args: &WorkerArgs) -> Result<Vec<JobReport>> {
        let worker = self.ctx.worker().ok_or_else(|| {
            AppError::MissingResource("worker needs dispatch.mode = \"broker\"".to_string())
        })?;
        let poll = Duration::from_millis(
            args.poll_ms
                .unwrap_or(self.config().dispatch.worker_poll_ms),
        );
        info!(burst = args.burst, poll_ms = poll.as_millis() as u64, "worker starting");
        Ok(worker.run(args.burst, poll).await?)
    }

    fn resolve(&self, args: &ResolveArgs) -> Result<ResolvedVideo> {
        let scope = if args.all {
            VideoScope::All
        } else {
            VideoScope::Viewer {
                user_id: args.user_id,
            }
        };
        let video_id = self.ctx.resolver.resolve(args.public_id, scope)?;
        Ok(ResolvedVideo {
            public_id: args.public_id,
            video_id,
        })
    }

    fn job_list(&self, args: &JobsListArgs) -> Result<JobList> {
        let broker = self.ctx.broker.as_ref().ok_or_else(|| {
            AppError::MissingResource("job queue needs dispatch.mode = \"broker\"".to_string())
        })?;
        let status = args
            .status
            .as_deref()
            .map(|value| {
                value
                    .parse::<JobStatus>()
                    .map_err(|_| AppError::InvalidArgument(format!("unknown job status '{value}'")))
            })
            .transpose()?;
        let rows = broker.list(status, args.limit)?;
        Ok(JobList { rows })
    }

    async fn video_add(&self, args: &VideoAddArgs) -> Result<VideoAdded> {
        let video_id = self.ctx.database.create_video(&NewVideo {
            title: args.title.clone(),
            description: args.description.clone(),
            owner_id: args.owner_id,
            is_published: args.published,
            created_at: None,
        })?;

        let source = match &args.source {
            Some(path) => {
                let target = self.ctx.renditions.layout().upload_path(video_id);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(path, &target)?;
                Some(target)
            }
            None => None,
        };

        let schedule = if args.autotranscode {
            Some(
                self.ctx
                    .autotranscoder
                    .schedule_default_renditions(video_id, false)
                    .await,
            )
        } else {
            None
        };
        Ok(VideoAdded {
            video_id,
            source,
            schedule,
        })
    }

    async fn health_check(&self) -> Vec<HealthEntry> {
        let config = self.config();
        let mut results = vec![
            self.check_path("vodkit.toml", &self.config_path),
            self.check_directory("media_root", &config.media_root()),
            self.check_directory("hls", &self.ctx.renditions.layout().hls_root()),
            self.check_database("renditions.sqlite", &config.renditions_db()),
        ];
        if config.cache.backend == CacheBackend::Sqlite {
            results.push(self.check_database("cache.sqlite", &config.cache_db()));
        }
        if let Some(broker) = &self.ctx.broker {
            results.push(self.check_database("broker.sqlite", &config.broker_db()));
            results.push(match broker.ping() {
                Ok(()) => HealthEntry::ok("broker", config.dispatch.queue_name.clone()),
                Err(err) => HealthEntry::error("broker", format!("unreachable: {err}")),
            });
        }
        results.push(check_binary("ffmpeg", &config.encoder.ffmpeg).await);
        results.push(check_binary("ffprobe", &config.encoder.ffprobe).await);
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(name, format!("{path} not found", path = path.display())),
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(name, format!("{path} not found", path = path.display()));
        }
        match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(conn) => {
                let pragma: rusqlite::Result<String> =
                    conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
                match pragma {
                    Ok(result) if result.to_lowercase() == "ok" => {
                        HealthEntry::ok(name, "integrity ok".to_string())
                    }
                    Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                    Err(err) => HealthEntry::warn(name, format!("error: {err}")),
                }
            }
            Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
        }
    }
}

fn apply_overrides(config: &mut VodkitConfig, cli: &Cli) {
    if let Some(media_root) = &cli.media_root {
        config.paths.media_root = media_root.to_string_lossy().to_string();
    }
    if let Some(data_dir) = &cli.data_dir {
        config.paths.data_dir = data_dir.to_string_lossy().to_string();
    }
    if let Some(mode) = cli.mode {
        config.dispatch.mode = mode.into();
    }
    if cli.fast {
        config.retry.fast_mode = true;
    }
}

async fn check_binary(name: &str, program: &str) -> HealthEntry {
    let args = vec!["-version".to_string()];
    match SystemCommandExecutor
        .run(Path::new(program), &args, Some(Duration::from_secs(10)))
        .await
    {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            HealthEntry::ok(name, stdout.lines().next().unwrap_or(program).to_string())
        }
        Ok(output) => HealthEntry::warn(
            name,
            format!("{program} -version exited with {:?}", output.status.code()),
        ),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            HealthEntry::error(name, format!("{program} not found"))
        }
        Err(err) => HealthEntry::warn(name, format!("{program}: {err}")),
    }
}

#[derive(Debug, Serialize)]
pub struct VideoStatusReport {
    pub video_id: VideoId,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub locked: bool,
    pub pending: bool,
    pub ready: Vec<String>,
}

impl DisplayFallback for VideoStatusReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("Video {}: {}", self.video_id, self.state)];
        if let Some(message) = &self.message {
            lines.push(format!("  message: {message}"));
        }
        if self.locked {
            lines.push("  lock held".to_string());
        }
        if self.pending {
            lines.push("  enqueue pending".to_string());
        }
        if self.ready.is_empty() {
            lines.push("  renditions: none".to_string());
        } else {
            lines.push(format!("  renditions: {}", self.ready.join(", ")));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for EnqueueResult {
    fn display(&self) -> String {
        let mut line = format!("[{}] {}", self.state, self.message);
        if let Some(job_id) = &self.job_id {
            line.push_str(&format!(
                " (job {job_id} on {})",
                self.queue.as_deref().unwrap_or("-")
            ));
        }
        if !self.encoded.is_empty() {
            line.push_str(&format!("\nencoded: {}", self.encoded.join(", ")));
        }
        line
    }
}

impl DisplayFallback for ScheduleOutcome {
    fn display(&self) -> String {
        match self {
            ScheduleOutcome::SourceMissing => "No source video, nothing scheduled".to_string(),
            ScheduleOutcome::Debounced => "Scheduled recently, skipped".to_string(),
            ScheduleOutcome::NothingMissing => "All default renditions present".to_string(),
            ScheduleOutcome::Scheduled {
                resolutions,
                result,
            } => format!("Scheduled {}\n{}", resolutions.join(", "), result.display()),
            ScheduleOutcome::Failed { message } => format!("Scheduling failed: {message}"),
        }
    }
}

impl DisplayFallback for IndexOutcome {
    fn display(&self) -> String {
        if self.skipped {
            return "Nothing indexed".to_string();
        }
        let action = if self.created {
            "created"
        } else if self.updated {
            "updated"
        } else {
            "unchanged"
        };
        let mut line = format!(
            "Stream {action}: {} segments written, {} bytes",
            self.segments, self.bytes
        );
        if self.missing > 0 {
            line.push_str(&format!(", {} missing on disk", self.missing));
        }
        line
    }
}

impl DisplayFallback for HealReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} videos, {} actions{}",
            self.videos.len(),
            self.action_count(),
            if self.dry_run { " (dry run)" } else { "" }
        )];
        for video in &self.videos {
            if video.actions.is_empty() && video.warnings.is_empty() {
                continue;
            }
            lines.push(format!("Video {}:", video.video_id));
            for action in &video.actions {
                lines.push(format!("  - {}", serde_json::to_string(action).unwrap_or_default()));
            }
            for warning in &video.warnings {
                lines.push(format!("  ! {warning}"));
            }
        }
        lines.join("\n")
    }
}

impl DisplayFallback for BulkEnqueueReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} videos, {} queued, {} failed{}",
            self.entries.len(),
            self.queued(),
            self.failed(),
            if self.dry_run { " (dry run)" } else { "" }
        )];
        for entry in &self.entries {
            let detail = match &entry.outcome {
                BulkOutcome::UnknownVideo => "unknown video".to_string(),
                BulkOutcome::SourceMissing => "no source".to_string(),
                BulkOutcome::Present => "all renditions present".to_string(),
                BulkOutcome::Planned { resolutions } => {
                    format!("would request {}", resolutions.join(", "))
                }
                BulkOutcome::Queued {
                    resolutions,
                    result,
                } => format!("{} [{}]", resolutions.join(", "), result.state),
                BulkOutcome::Failed {
                    resolutions,
                    message,
                } => format!("{} failed: {message}", resolutions.join(", ")),
            };
            lines.push(format!("  {}: {detail}", entry.video_id));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for PruneReport {
    fn display(&self) -> String {
        if self.orphans.is_empty() {
            return "No orphaned rendition directories".to_string();
        }
        let ids = |ids: &[VideoId]| {
            ids.iter()
                .map(VideoId::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        if self.confirm {
            format!("Removed {} of {}: {}", self.deleted.len(), self.orphans.len(), ids(&self.deleted))
        } else {
            format!(
                "{} orphaned: {} (rerun with --confirm to delete)",
                self.orphans.len(),
                ids(&self.orphans)
            )
        }
    }
}

impl DisplayFallback for Vec<JobReport> {
    fn display(&self) -> String {
        if self.is_empty() {
            return "No jobs processed".to_string();
        }
        self.iter()
            .map(|report| {
                format!(
                    "{} video={} {} {}",
                    report.job_id,
                    report.video_id,
                    if report.succeeded { "ok" } else { "failed" },
                    report.message
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ResolvedVideo {
    pub public_id: i64,
    pub video_id: VideoId,
}

impl DisplayFallback for ResolvedVideo {
    fn display(&self) -> String {
        format!("{} -> {}", self.public_id, self.video_id)
    }
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub rows: Vec<JobRecord>,
}

impl DisplayFallback for JobList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Queue empty".to_string();
        }
        let mut lines = Vec::new();
        for job in &self.rows {
            let enqueued = job
                .enqueued_at
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_else(|| "-".to_string());
            let mut line = format!(
                "{id} video={video} [{res}] status={status} enqueued={enqueued}",
                id = job.id,
                video = job.video_id,
                res = job.resolutions.join(","),
                status = job.status.as_str(),
            );
            if let Some(error) = &job.error {
                line.push_str(&format!(" error={error}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct VideoAdded {
    pub video_id: VideoId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleOutcome>,
}

impl DisplayFallback for VideoAdded {
    fn display(&self) -> String {
        let mut lines = vec![format!("Video {} created", self.video_id)];
        if let Some(source) = &self.source {
            lines.push(format!("  source: {}", source.display()));
        }
        if let Some(schedule) = &self.schedule {
            lines.push(format!("  {}", schedule.display()));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| format!("[{}] {}: {}", entry.status, entry.name, entry.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli(root: &Path, mode: ModeArg, command: Commands) -> Cli {
        Cli {
            config: Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/vodkit.toml"),
            media_root: Some(root.join("media")),
            data_dir: Some(root.join("data")),
            mode: Some(mode),
            fast: true,
            format: OutputFormat::Json,
            command,
        }
    }

    fn prepare_test_context(mode: ModeArg) -> (TempDir, AppContext) {
        let temp = TempDir::new().unwrap();
        let context = AppContext::new(&cli(temp.path(), mode, Commands::Health)).unwrap();
        (temp, context)
    }

    #[test]
    fn overrides_replace_config_paths() {
        let (temp, context) = prepare_test_context(ModeArg::Inline);
        let config = context.config();
        assert_eq!(config.media_root(), temp.path().join("media"));
        assert_eq!(config.dispatch.mode, DispatchMode::Inline);
        assert!(config.retry.fast_mode);
        assert!(context.ctx.broker.is_none());
        assert!(config.renditions_db().exists());
    }

    #[tokio::test]
    async fn video_add_copies_source_and_status_reports_unknown() {
        let (temp, context) = prepare_test_context(ModeArg::Inline);
        let upload = temp.path().join("clip.mp4");
        fs::write(&upload, b"not really mp4").unwrap();

        let added = context
            .video_add(&VideoAddArgs {
                title: "Clip".to_string(),
                description: String::new(),
                owner_id: None,
                published: true,
                source: Some(upload),
                autotranscode: false,
            })
            .await
            .unwrap();
        let source = added.source.unwrap();
        assert_eq!(fs::read(&source).unwrap(), b"not really mp4");

        let status = context.video_status(added.video_id).await.unwrap();
        assert_eq!(status.state, "unknown");
        assert!(!status.locked);
        assert!(status.ready.is_empty());

        let resolved = context
            .resolve(&ResolveArgs {
                public_id: 1,
                user_id: None,
                all: false,
            })
            .unwrap();
        assert_eq!(resolved.video_id, added.video_id);
    }

    #[test]
    fn job_listing_needs_broker_mode() {
        let (_temp, inline) = prepare_test_context(ModeArg::Inline);
        let err = inline
            .job_list(&JobsListArgs {
                status: None,
                limit: 5,
            })
            .unwrap_err();
        assert!(matches!(err, AppError::MissingResource(_)));

        let (_temp, broker) = prepare_test_context(ModeArg::Broker);
        let jobs = broker
            .job_list(&JobsListArgs {
                status: Some("queued".to_string()),
                limit: 5,
            })
            .unwrap();
        assert!(jobs.rows.is_empty());
        let err = broker
            .job_list(&JobsListArgs {
                status: Some("sleeping".to_string()),
                limit: 5,
            })
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unsupported_resolution_is_rejected() {
        let (_temp, context) = prepare_test_context(ModeArg::Inline);
        let err = context
            .enqueue(&EnqueueArgs {
                video_id: 1,
                resolutions: vec!["9999p".to_string()],
                force: false,
            })
            .await
            .unwrap_err();
        match err {
            AppError::Transcode(err) => assert_eq!(err.status_code(), 400),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn health_reports_databases() {
        let (_temp, context) = prepare_test_context(ModeArg::Broker);
        let report = context.health_check().await;
        let renditions = report
            .iter()
            .find(|entry| entry.name == "renditions.sqlite")
            .unwrap();
        assert!(matches!(renditions.status, CheckStatus::Ok));
        let broker = report.iter().find(|entry| entry.name == "broker").unwrap();
        assert!(matches!(broker.status, CheckStatus::Ok));
        assert!(report.iter().any(|entry| entry.name == "ffmpeg"));
    }

    #[tokio::test]
    async fn enqueue_missing_defaults_to_every_video() {
        let (temp, context) = prepare_test_context(ModeArg::Broker);
        let upload = temp.path().join("clip.mp4");
        fs::write(&upload, b"source").unwrap();
        let with_source = context
            .video_add(&VideoAddArgs {
                title: "With source".to_string(),
                description: String::new(),
                owner_id: None,
                published: true,
                source: Some(upload),
                autotranscode: false,
            })
            .await
            .unwrap();
        let bare = context
            .video_add(&VideoAddArgs {
                title: "Bare".to_string(),
                description: String::new(),
                owner_id: None,
                published: false,
                source: None,
                autotranscode: false,
            })
            .await
            .unwrap();

        let report = context
            .enqueue_missing(&EnqueueMissingArgs {
                videos: Vec::new(),
                resolutions: vec!["480p".to_string()],
                dry_run: true,
                force: false,
            })
            .await
            .unwrap();
        assert_eq!(report.entries.len(), 2);
        for entry in &report.entries {
            if entry.video_id == with_source.video_id {
                assert!(matches!(
                    &entry.outcome,
                    BulkOutcome::Planned { resolutions } if resolutions == &["480p".to_string()]
                ));
            } else {
                assert_eq!(entry.video_id, bare.video_id);
                assert!(matches!(entry.outcome, BulkOutcome::SourceMissing));
            }
        }
        assert!(report.display().contains("(dry run)"));
        assert!(context.job_list(&JobsListArgs { status: None, limit: 5 }).unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn prune_keeps_directories_without_confirm() {
        let (_temp, context) = prepare_test_context(ModeArg::Inline);
        let orphan = context.ctx.renditions.layout().video_dir(4242);
        fs::create_dir_all(orphan.join("480p")).unwrap();

        let report = context.ctx.indexer.prune_orphans(false).await.unwrap();
        assert_eq!(report.orphans, vec![4242]);
        assert!(report.deleted.is_empty());
        assert!(orphan.exists());
        assert!(report.display().contains("--confirm"));
    }

    #[test]
    fn heal_report_text_lists_actions() {
        let report = HealReport {
            dry_run: true,
            videos: vec![vodkit_core::VideoHealReport {
                video_id: 3,
                actions: vec![vodkit_core::HealAction::RebuildMaster],
                warnings: vec!["720p: manifest on disk is a stub".to_string()],
                ..Default::default()
            }],
        };
        let text = report.display();
        assert!(text.starts_with("1 videos, 1 actions (dry run)"));
        assert!(text.contains("rebuild_master"));
        assert!(text.contains("! 720p"));
    }
}
