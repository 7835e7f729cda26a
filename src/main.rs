mod cli;

use std::{io, process};

use steward::config::Config;
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = cli::run(&config) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Logs go to stderr so stdout stays clean for command output and JSON.
/// Verbosity comes from `STEWARD_LOG` (e.g. `STEWARD_LOG=steward=debug`).
fn init_logging() {
    let filter = EnvFilter::try_from_env("STEWARD_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}
