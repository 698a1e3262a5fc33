use std::fs;
use std::path::{Path, PathBuf};

use directories::{BaseDirs, ProjectDirs};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::EchoNotesError;

const CONFIG_FILE_NAME: &str = "echo-notes.toml";
const SCHEDULE_FILE_NAME: &str = "schedule_config.json";
const ENV_PREFIX: &str = "ECHO_NOTES_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const DEFAULT_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            level: Self::DEFAULT_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        // The logger isn't running yet when config is loaded, so problems go to stderr
        let str_original = self.level.clone();
        self.level = self.level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.level.as_str()) {
            eprintln!(
                "Config error: log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::DEFAULT_LEVEL
            );
            self.level = Self::DEFAULT_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PathsConfig {
    /// Directory holding the markdown notes
    pub notes_dir: PathBuf,
    /// Directory holding the PID file and daemon logs
    pub state_dir: PathBuf,
    /// Persisted schedule configuration (JSON)
    pub schedule_file: PathBuf,
}

impl PathsConfig {
    const PID_FILE_NAME: &str = "echo-notes.pid";
    const LOG_FILE_NAME: &str = "daemon.log";
    const ERROR_LOG_FILE_NAME: &str = "daemon.error.log";

    fn default() -> Self {
        let notes_root = BaseDirs::new()
            .map(|dirs| dirs.home_dir().join("Documents").join("notes"))
            .unwrap_or_else(|| PathBuf::from("notes"));

        let schedule_file = ProjectDirs::from("", "", "echo-notes")
            .map(|dirs| dirs.config_dir().join(SCHEDULE_FILE_NAME))
            .unwrap_or_else(|| notes_root.join(SCHEDULE_FILE_NAME));

        PathsConfig {
            notes_dir: notes_root.join("log"),
            state_dir: notes_root,
            schedule_file,
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join(Self::PID_FILE_NAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join(Self::LOG_FILE_NAME)
    }

    pub fn error_log_file(&self) -> PathBuf {
        self.state_dir.join(Self::ERROR_LOG_FILE_NAME)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl LlmConfig {
    fn default() -> Self {
        LlmConfig {
            url: "http://localhost:8080/v1/chat/completions".to_owned(),
            model: "qwen2.5-7b-instruct-1m".to_owned(),
            max_tokens: 2000,
            timeout_secs: 120,
        }
    }

    fn ensure_valid(&mut self) {
        if self.timeout_secs == 0 {
            eprintln!("Config error: llm timeout_secs of 0 is invalid - using default of 120");
            self.timeout_secs = 120;
        }
        if self.max_tokens == 0 {
            eprintln!("Config error: llm max_tokens of 0 is invalid - using default of 2000");
            self.max_tokens = 2000;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// How long `stop` waits for the daemon to exit after SIGTERM
    pub stop_timeout_secs: u64,
    /// Seconds between scheduling decisions
    pub tick_secs: u64,
}

impl DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            stop_timeout_secs: 10,
            tick_secs: 60,
        }
    }

    fn ensure_valid(&mut self) {
        if self.tick_secs == 0 {
            eprintln!("Config error: daemon tick_secs of 0 is invalid - using default of 60");
            self.tick_secs = 60;
        }
    }
}

/// System instructions sent to the LLM with each job's input
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PromptsConfig {
    /// Instruction for cleaning up a single raw note
    pub daily_notes: String,
    /// Instruction for writing the weekly digest
    pub weekly_summary: String,
}

impl PromptsConfig {
    const DEFAULT_DAILY_NOTES: &str = "You are an assistant that turns raw, hastily written \
journal notes into clean, structured markdown. Fix spelling and grammar, group related \
thoughts under headings, turn tasks into checklists and keep every fact from the \
original. Begin your answer with the heading '## CLEANED & STRUCTURED NOTES'.";

    const DEFAULT_WEEKLY_SUMMARY: &str = "You are an assistant that writes a weekly digest \
from a week's worth of journal notes. Summarize the main themes, list accomplishments, \
open tasks and decisions, and call out anything that needs follow-up next week. Answer \
in markdown.";

    fn default() -> Self {
        PromptsConfig {
            daily_notes: Self::DEFAULT_DAILY_NOTES.to_owned(),
            weekly_summary: Self::DEFAULT_WEEKLY_SUMMARY.to_owned(),
        }
    }

    fn ensure_valid(&mut self) {
        if self.daily_notes.trim().is_empty() {
            eprintln!("Config error: prompts daily_notes is empty - using the default prompt");
            self.daily_notes = Self::DEFAULT_DAILY_NOTES.to_owned();
        }
        if self.weekly_summary.trim().is_empty() {
            eprintln!("Config error: prompts weekly_summary is empty - using the default prompt");
            self.weekly_summary = Self::DEFAULT_WEEKLY_SUMMARY.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub llm: LlmConfig,
    pub prompts: PromptsConfig,
    pub daemon: DaemonConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            logging: LoggingConfig::default(),
            paths: PathsConfig::default(),
            llm: LlmConfig::default(),
            prompts: PromptsConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl AppConfig {
    /// Location of the TOML file when none is given on the command line
    pub fn default_config_path() -> Result<PathBuf, EchoNotesError> {
        ProjectDirs::from("", "", "echo-notes")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .ok_or_else(|| {
                EchoNotesError::Config("Failed to determine config directory".to_string())
            })
    }

    /// Loads the configuration from a TOML file, layering `ECHO_NOTES_` environment
    /// variables on top. If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(config_path: &Path) -> Self {
        let default_config = AppConfig::default();

        if !config_path.exists() {
            Self::write_default(config_path, &default_config);
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn write_default(config_path: &Path, default_config: &AppConfig) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(default_config) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(e) => eprintln!("Failed to serialize default config: {}", e),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.llm.ensure_valid();
        self.prompts.ensure_valid();
        self.daemon.ensure_valid();
    }
}
