mod cli;
mod config;
mod daemon;
mod error;
mod jobs;
mod lifecycle;
mod llm;
mod logging;
mod notes;
mod schedule_config;
mod time_gate;

use cli::Cli;
use log::error;

fn main() {
    // Logging is configured inside the command handler because its target
    // depends on the loaded config and on whether the daemon detaches.
    // Set RUST_LOG to override the configured level:
    // ERROR → WARN → INFO → DEBUG → TRACE
    if let Err(err) = Cli::handle_command_line() {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
