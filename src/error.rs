use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EchoNotesError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into EchoNotesError automatically

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] Box<figment::Error>),

    #[error("Logger error: {0}")]
    LoggerError(#[from] flexi_logger::FlexiLoggerError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Process lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Daemon is already running (PID: {0})")]
    AlreadyRunning(i32),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl From<figment::Error> for EchoNotesError {
    fn from(err: figment::Error) -> Self {
        EchoNotesError::ConfigError(Box::new(err))
    }
}
