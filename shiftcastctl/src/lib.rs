use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use shiftcast_core::{
    is_active, load_config, BuildError, ChannelBundle, ChannelRepository, CommandBuilder,
    ConfigError, EnforcerLoop, JobCommand, JobExit, JobKey, JobOutput, JobPurpose, LaunchSpec,
    ProcessLauncher, PruneReport, RetentionEngine, SegmentInventory, ShiftcastConfig,
    SqliteChannelStore, StoreError, SystemLauncher,
};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod signal;

use signal::StopSignals;

/// Grace period given to a foreground job after Ctrl-C.
const JOB_STOP_GRACE: Duration = Duration::from_secs(5);

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cannot build command: {0}")]
    Build(#[from] BuildError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("job {key} ended with {exit}")]
    JobFailed { key: JobKey, exit: JobExit },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Shiftcast channel enforcer control interface", long_about = None)]
pub struct Cli {
    /// Path to shiftcast.toml
    #[arg(long, default_value = "configs/shiftcast.toml")]
    pub config: PathBuf,
    /// Channel store override (replaces paths.store)
    #[arg(long)]
    pub store: Option<PathBuf>,
    /// Media root override (replaces paths.media_root)
    #[arg(long)]
    pub media_root: Option<PathBuf>,
    /// Output format
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

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the enforcer loop until SIGINT/SIGTERM
    Run,
    /// Prints the ffmpeg invocation for one job without launching it
    ShowCmd(JobArgs),
    /// Runs one job in the foreground
    RunJob(JobArgs),
    /// Lists channels with their schedule and mode
    Channels,
    /// Applies the retention policy of one channel once
    Prune(PruneArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PurposeArg {
    Record,
    Playback,
}

impl From<PurposeArg> for JobPurpose {
    fn from(value: PurposeArg) -> Self {
        match value {
            PurposeArg::Record => JobPurpose::Record,
            PurposeArg::Playback => JobPurpose::Playback,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Channel id
    pub channel_id: i64,
    #[arg(long, value_enum, default_value_t = PurposeArg::Playback)]
    pub purpose: PurposeArg,
    /// Output target id, required for playback
    #[arg(long)]
    pub target_id: Option<i64>,
}

#[derive(Args, Debug, Clone)]
pub struct PruneArgs {
    /// Channel id
    pub channel_id: i64,
    /// Report what would be deleted without deleting
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;
    init_tracing(&context.config.logging.level);
    let now = Local::now().naive_local();

    match &cli.command {
        Commands::Run => {
            let summary = context.run_enforcer()?;
            render(&summary, cli.format)?;
        }
        Commands::ShowCmd(args) => {
            let view = context.show_command(args, now)?;
            render(&view, cli.format)?;
        }
        Commands::RunJob(args) => {
            let report = context.run_job(args, now)?;
            render(&report, cli.format)?;
            if !report.interrupted && !report.exit.success() {
                return Err(AppError::JobFailed {
                    key: report.key,
                    exit: report.exit,
                });
            }
        }
        Commands::Channels => {
            let list = context.channel_list(now)?;
            render(&list, cli.format)?;
        }
        Commands::Prune(args) => {
            let report = context.prune(args, now)?;
            render(&report, cli.format)?;
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
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
    config: ShiftcastConfig,
    store: SqliteChannelStore,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_config(&cli.config)?;
        if let Some(store) = &cli.store {
            config.paths.store = store.clone();
        }
        if let Some(root) = &cli.media_root {
            config.paths.media_root = root.clone();
        }

        if !config.paths.store.exists() {
            return Err(AppError::MissingResource(format!(
                "channel store {}",
                config.paths.store.display()
            )));
        }
        let store = SqliteChannelStore::builder()
            .path(&config.paths.store)
            .read_only(true)
            .build()?;

        Ok(Self { config, store })
    }

    fn bundle(&self, channel_id: i64) -> Result<ChannelBundle> {
        self.store
            .load_channel(channel_id)?
            .ok_or_else(|| AppError::MissingResource(format!("channel {channel_id}")))
    }

    fn job_command(&self, args: &JobArgs, now: NaiveDateTime) -> Result<(JobKey, JobCommand)> {
        let bundle = self.bundle(args.channel_id)?;
        let builder = CommandBuilder::from_config(&self.config);
        match JobPurpose::from(args.purpose) {
            JobPurpose::Record => {
                let command = builder.build(&bundle, JobPurpose::Record, None, now)?;
                Ok((JobKey::record(bundle.channel.id), command))
            }
            JobPurpose::Playback => {
                let target_id = args.target_id.ok_or_else(|| {
                    AppError::MissingResource("--target-id is required for playback".into())
                })?;
                let target = bundle.target(target_id).ok_or_else(|| {
                    AppError::MissingResource(format!(
                        "target {target_id} on channel {}",
                        bundle.channel.id
                    ))
                })?;
                let command = builder.build(&bundle, JobPurpose::Playback, Some(target), now)?;
                Ok((JobKey::playback(bundle.channel.id, target_id), command))
            }
        }
    }

    fn show_command(&self, args: &JobArgs, now: NaiveDateTime) -> Result<CommandView> {
        let (key, command) = self.job_command(args, now)?;
        Ok(CommandView {
            key,
            command_line: command.to_string(),
            argv: command.argv(),
        })
    }

    fn run_job(&self, args: &JobArgs, now: NaiveDateTime) -> Result<JobRunReport> {
        let (key, command) = self.job_command(args, now)?;
        let command_line = command.to_string();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        runtime.block_on(async move {
            let mut signals = StopSignals::register()?;
            info!(%key, command = %command_line, "starting foreground job");
            let mut process = SystemLauncher.launch(&LaunchSpec {
                key,
                command,
                output: JobOutput::Inherit,
            })?;

            let outcome = tokio::select! {
                exit = process.wait() => Ok(exit?),
                signal = signals.recv() => Err(signal),
            };
            let (exit, interrupted) = match outcome {
                Ok(exit) => (exit, false),
                Err(signal) => {
                    info!(%key, signal, "stopping foreground job");
                    (process.terminate(JOB_STOP_GRACE).await?, true)
                }
            };

            Ok::<_, AppError>(JobRunReport {
                key,
                command_line,
                exit,
                interrupted,
            })
        })
    }

    fn run_enforcer(&self) -> Result<RunSummary> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let repository: Arc<dyn ChannelRepository> = Arc::new(self.store.clone());
        let mut enforcer = EnforcerLoop::new(&self.config, repository, None);

        runtime.block_on(async move {
            let mut signals = StopSignals::register()?;
            let stopped = enforcer
                .run(async move {
                    let signal = signals.recv().await;
                    info!(signal, "shutdown requested");
                })
                .await;
            Ok::<_, AppError>(RunSummary { stopped })
        })
    }

    fn channel_list(&self, now: NaiveDateTime) -> Result<ChannelList> {
        let rows = self
            .store
            .load_channels()?
            .into_iter()
            .map(|bundle| ChannelRow {
                id: bundle.channel.id,
                name: bundle.channel.name.clone(),
                enabled: bundle.channel.enabled,
                active_now: is_active(&bundle.channel, now),
                schedule: bundle.channel.schedule.summary(),
                mode: match bundle.active_delay() {
                    Some(delay) => format!("timeshift {delay}s"),
                    None => "live".to_string(),
                },
                profile: bundle.profile.name.clone(),
                enabled_targets: bundle.enabled_targets().count(),
            })
            .collect();
        Ok(ChannelList { rows })
    }

    fn prune(&self, args: &PruneArgs, now: NaiveDateTime) -> Result<PruneReport> {
        let bundle = self.bundle(args.channel_id)?;
        let engine = RetentionEngine::new(
            SegmentInventory::new(self.config.media_layout()),
            self.config.playback.playlist_window_seconds,
            self.config.retention.safety_margin_seconds,
        );
        Ok(engine.prune(&bundle, now, args.dry_run))
    }
}

#[derive(Debug, Serialize)]
pub struct CommandView {
    pub key: JobKey,
    pub command_line: String,
    pub argv: Vec<String>,
}

impl DisplayFallback for CommandView {
    fn display(&self) -> String {
        self.command_line.clone()
    }
}

#[derive(Debug, Serialize)]
pub struct JobRunReport {
    pub key: JobKey,
    pub command_line: String,
    pub exit: JobExit,
    pub interrupted: bool,
}

impl DisplayFallback for JobRunReport {
    fn display(&self) -> String {
        let suffix = if self.interrupted { " (interrupted)" } else { "" };
        format!("{}: {}{suffix}", self.key, self.exit)
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub stopped: Vec<JobKey>,
}

impl DisplayFallback for RunSummary {
    fn display(&self) -> String {
        if self.stopped.is_empty() {
            return "Enforcer stopped, no jobs were running".to_string();
        }
        let keys: Vec<String> = self.stopped.iter().map(ToString::to_string).collect();
        format!("Enforcer stopped {} job(s): {}", keys.len(), keys.join(", "))
    }
}

#[derive(Debug, Serialize)]
pub struct ChannelList {
    pub rows: Vec<ChannelRow>,
}

#[derive(Debug, Serialize)]
pub struct ChannelRow {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub active_now: bool,
    pub schedule: String,
    pub mode: String,
    pub profile: String,
    pub enabled_targets: usize,
}

impl DisplayFallback for ChannelList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No channels configured".to_string();
        }
        let mut lines = Vec::new();
        for row in &self.rows {
            let state = match (row.enabled, row.active_now) {
                (false, _) => "disabled",
                (true, true) => "on air",
                (true, false) => "off air",
            };
            lines.push(format!(
                "#{id} {name} | {state} | {schedule} | {mode} | profile={profile} | targets={targets}",
                id = row.id,
                name = row.name,
                schedule = row.schedule,
                mode = row.mode,
                profile = row.profile,
                targets = row.enabled_targets,
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for PruneReport {
    fn display(&self) -> String {
        let verb = if self.dry_run { "would delete" } else { "deleted" };
        format!(
            "{channel}: scanned={scanned} {verb}={deleted} protected={protected} missing={missing} errors={errors} removed_dirs={dirs}",
            channel = self.channel,
            scanned = self.scanned,
            deleted = self.deleted,
            protected = self.skipped_protected,
            missing = self.skipped_missing,
            errors = self.skipped_errors,
            dirs = self.removed_dirs,
        )
    }
}
