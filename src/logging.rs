use std::path::Path;

use flexi_logger::{FileSpec, Logger, LoggerHandle};

use crate::config::LoggingConfig;
use crate::error::EchoNotesError;

/// Where log records go
pub enum LogTarget<'a> {
    /// Interactive commands and foreground runs
    Stderr,
    /// The detached daemon, appending to the given file
    File(&'a Path),
}

fn log_spec(config: &LoggingConfig) -> String {
    // HTTP internals are chatty at debug level; keep them quiet unless RUST_LOG asks
    format!(
        "{}, hyper=warn, hyper_util=warn, reqwest=warn",
        config.level
    )
}

/// Start the global logger. `RUST_LOG` overrides the configured level.
///
/// The returned handle must be kept alive for as long as logging is needed.
pub fn init_logging(
    config: &LoggingConfig,
    target: LogTarget<'_>,
) -> Result<LoggerHandle, EchoNotesError> {
    let logger = Logger::try_with_env_or_str(log_spec(config))?;

    let logger = match target {
        LogTarget::Stderr => logger
            .log_to_stderr()
            .format(flexi_logger::default_format),
        LogTarget::File(path) => {
            let spec = FileSpec::try_from(path)?.suppress_timestamp();
            logger
                .log_to_file(spec)
                .append()
                .format(flexi_logger::detailed_format)
        }
    };

    Ok(logger.start()?)
}
