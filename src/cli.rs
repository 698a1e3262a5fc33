use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use flexi_logger::LoggerHandle;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::daemon::{DaemonExit, DaemonLoop, DEFAULT_POLL};
use crate::error::EchoNotesError;
use crate::jobs::JobRunner;
use crate::lifecycle::{DetachedStreams, PidFile, ProcessLifecycleManager, StopOutcome};
use crate::llm::{HttpLlmClient, LlmClient};
use crate::logging::{init_logging, LogTarget};
use crate::notes::{NoteProcessor, SummaryGenerator};
use crate::schedule_config::{parse_weekday, JsonConfigStore, ScheduleConfig};
use crate::time_gate::{Clock, SystemClock};

#[derive(Parser)]
#[command(
    name = "echo-notes",
    version,
    about = "Echo-Notes: scheduled LLM cleanup and weekly summaries for plain-text notes"
)]
pub struct Cli {
    /// Path to the application config file (default: platform config directory)
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the scheduling daemon (default if no command specified)
    Start {
        /// Detach from the terminal and run in the background
        #[arg(long = "daemon", short = 'd', default_value_t = false)]
        daemon: bool,
    },

    /// Stop a running daemon
    Stop,

    /// Report whether the daemon is running
    Status {
        /// Print the status as JSON
        #[arg(long = "json", default_value_t = false)]
        json: bool,
    },

    /// Change the schedule; a running daemon picks it up on its next tick
    Configure(ConfigureArgs),

    /// Print the current schedule as JSON
    #[command(name = "show-config")]
    ShowConfig,

    /// Process unprocessed notes now
    Process,

    /// Generate the weekly summary now
    Summarize,
}

#[derive(Args, Default)]
pub struct ConfigureArgs {
    /// Minutes between note-processing runs
    #[arg(long = "processing-interval", value_parser = clap::value_parser!(u32).range(1..))]
    pub processing_interval: Option<u32>,

    /// Minutes between summary runs (10080 = weekly on --summary-day at --summary-hour)
    #[arg(long = "summary-interval", value_parser = clap::value_parser!(u32).range(1..))]
    pub summary_interval: Option<u32>,

    /// Weekday for the weekly summary: 0-6 (0 = Monday) or a name like "sunday"
    #[arg(long = "summary-day", value_parser = parse_weekday)]
    pub summary_day: Option<u8>,

    /// Hour of day (0-23) for the weekly summary
    #[arg(long = "summary-hour", value_parser = clap::value_parser!(u8).range(0..=23))]
    pub summary_hour: Option<u8>,

    /// Enable the daemon
    #[arg(long = "enable", conflicts_with = "disable", default_value_t = false)]
    pub enable: bool,

    /// Disable the daemon; a running daemon exits on its next tick
    #[arg(long = "disable", default_value_t = false)]
    pub disable: bool,
}

impl ConfigureArgs {
    fn is_empty(&self) -> bool {
        self.processing_interval.is_none()
            && self.summary_interval.is_none()
            && self.summary_day.is_none()
            && self.summary_hour.is_none()
            && !self.enable
            && !self.disable
    }

    fn apply(&self, config: &mut ScheduleConfig) {
        if let Some(v) = self.processing_interval {
            config.processing_interval = v;
        }
        if let Some(v) = self.summary_interval {
            config.summary_interval = v;
        }
        if let Some(v) = self.summary_day {
            config.summary_day = v;
        }
        if let Some(v) = self.summary_hour {
            config.summary_hour = v;
        }
        if self.enable {
            config.daemon_enabled = true;
        }
        if self.disable {
            config.daemon_enabled = false;
        }
    }
}

impl Cli {
    pub fn handle_command_line() -> Result<(), EchoNotesError> {
        let args = Cli::parse();

        let config_path = match args.config {
            Some(path) => path,
            None => AppConfig::default_config_path()?,
        };
        let mut config = AppConfig::load_config(&config_path);
        absolutize_paths(&mut config)?;

        // Default to a foreground daemon if no command specified
        let command = args.command.unwrap_or(Command::Start { daemon: false });

        // The detached daemon starts its own file logger once it has forked
        let _logger = match command {
            Command::Start { daemon: true } => None,
            _ => Some(init_logging(&config.logging, LogTarget::Stderr)?),
        };
        debug!("Loaded config from {}: {:?}", config_path.display(), config);

        match command {
            Command::Start { daemon } => Self::start(&config, daemon),
            Command::Stop => Self::stop(&config),
            Command::Status { json } => Self::status(&config, json),
            Command::Configure(configure) => Self::configure(&config, &configure),
            Command::ShowConfig => Self::show_config(&config),
            Command::Process => Self::run_once(&config, JobKind::Process),
            Command::Summarize => Self::run_once(&config, JobKind::Summarize),
        }
    }

    fn lifecycle(config: &AppConfig) -> ProcessLifecycleManager {
        ProcessLifecycleManager::new(
            PidFile::new(config.paths.pid_file()),
            Duration::from_secs(config.daemon.stop_timeout_secs),
        )
    }

    fn start(config: &AppConfig, detached: bool) -> Result<(), EchoNotesError> {
        let manager = Self::lifecycle(config);
        let streams = DetachedStreams {
            stdout: config.paths.log_file(),
            stderr: config.paths.error_log_file(),
        };

        // Held until the daemon exits
        let mut _file_logger: Option<LoggerHandle> = None;

        let exit = manager.start(detached.then_some(&streams), || {
            if detached {
                _file_logger = Some(init_logging(
                    &config.logging,
                    LogTarget::File(&config.paths.log_file()),
                )?);
            }
            build_daemon(config)
        })?;

        match exit {
            DaemonExit::StopRequested => info!("Daemon stopped"),
            DaemonExit::Disabled => info!("Daemon exited because it is disabled in the schedule"),
        }
        Ok(())
    }

    fn stop(config: &AppConfig) -> Result<(), EchoNotesError> {
        match Self::lifecycle(config).stop()? {
            StopOutcome::NotRunning => println!("Daemon is not running"),
            StopOutcome::Stopped { pid } => println!("Daemon (PID: {}) stopped successfully", pid),
            StopOutcome::TimedOut { pid } => println!(
                "Daemon (PID: {}) did not stop within {} seconds, may need to be killed manually",
                pid, config.daemon.stop_timeout_secs
            ),
        }
        Ok(())
    }

    fn status(config: &AppConfig, json: bool) -> Result<(), EchoNotesError> {
        let status = Self::lifecycle(config).status()?;
        if json {
            println!("{}", serde_json::to_string(&status)?);
        } else if let (true, Some(pid)) = (status.running, status.pid) {
            println!("Daemon is running (PID: {})", pid);
        } else {
            println!("Daemon is not running");
        }
        Ok(())
    }

    fn configure(config: &AppConfig, args: &ConfigureArgs) -> Result<(), EchoNotesError> {
        let store = JsonConfigStore::new(&config.paths.schedule_file);
        let mut schedule = store.load();

        if !args.is_empty() {
            args.apply(&mut schedule);
            store.reconfigure(&schedule)?;
            println!("Configuration saved to {}", store.path().display());
        }

        print_schedule(&schedule);
        Ok(())
    }

    fn show_config(config: &AppConfig) -> Result<(), EchoNotesError> {
        let store = JsonConfigStore::new(&config.paths.schedule_file);
        println!("{}", serde_json::to_string_pretty(&store.load())?);
        Ok(())
    }

    fn run_once(config: &AppConfig, kind: JobKind) -> Result<(), EchoNotesError> {
        let runner = build_runner(config, Arc::new(SystemClock))?;
        let finished = match kind {
            JobKind::Process => runner.run_note_processing(),
            JobKind::Summarize => runner.run_summary_generation(),
        };

        match finished {
            Some(at) => {
                println!("{} finished at {}", kind.label(), at.format("%Y-%m-%d %H:%M:%S"));
                Ok(())
            }
            None => Err(EchoNotesError::Error(format!(
                "{} failed, see the log for details",
                kind.label()
            ))),
        }
    }
}

#[derive(Clone, Copy)]
enum JobKind {
    Process,
    Summarize,
}

impl JobKind {
    fn label(self) -> &'static str {
        match self {
            JobKind::Process => "Note processing",
            JobKind::Summarize => "Summary generation",
        }
    }
}

fn print_schedule(schedule: &ScheduleConfig) {
    println!("Current configuration:");
    println!("  Process notes every {} minutes", schedule.processing_interval);
    println!("  Generate summary every {} minutes", schedule.summary_interval);
    if schedule.is_weekly() {
        println!("  Summary day: {}", schedule.summary_day_name());
        println!("  Summary hour: {}:00", schedule.summary_hour);
    }
    println!("  Daemon enabled: {}", schedule.daemon_enabled);
}

/// The detached daemon changes directory to `/`, so every path must be absolute
fn absolutize_paths(config: &mut AppConfig) -> Result<(), EchoNotesError> {
    let paths = &mut config.paths;
    paths.notes_dir = std::path::absolute(&paths.notes_dir)?;
    paths.state_dir = std::path::absolute(&paths.state_dir)?;
    paths.schedule_file = std::path::absolute(&paths.schedule_file)?;
    Ok(())
}

fn build_runner(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<JobRunner, EchoNotesError> {
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(&config.llm)?);
    let notes_dir = &config.paths.notes_dir;

    let prompts = &config.prompts;

    Ok(JobRunner::new(
        Box::new(NoteProcessor::new(
            notes_dir,
            Arc::clone(&llm),
            &prompts.daily_notes,
        )),
        Box::new(SummaryGenerator::new(
            notes_dir,
            llm,
            &prompts.weekly_summary,
            Arc::clone(&clock),
        )),
        clock,
    ))
}

fn build_daemon(config: &AppConfig) -> Result<DaemonLoop, EchoNotesError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = JsonConfigStore::new(&config.paths.schedule_file);
    let initial = store.load();
    let runner = build_runner(config, Arc::clone(&clock))?;

    Ok(
        DaemonLoop::new(Box::new(store), runner, clock, CancellationToken::new())
            .with_timing(Duration::from_secs(config.daemon.tick_secs), DEFAULT_POLL)
            .with_config(initial),
    )
}
