//! Stratbox CLI application
//!
//! Validates untrusted strategy sources and runs the ones that pass inside
//! locked-down containers.
//!
//! # Installation
//!
//! ```bash
//! cargo install --path crates/stratbox-cli
//! ```
//!
//! # Exit status
//!
//! - `0`: every strategy was safe or succeeded
//! - `1`: a strategy was rejected, failed, timed out or hit a limit
//! - `2`: the sandbox itself failed (engine down, bad configuration)

mod args;
mod commands;
mod console;
mod router;
mod signal_handler;

use args::{Cli, LogFormat};
use clap::Parser;
use commands::Verdict;
use console::CliConsole;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match router::route(cli).await {
        Ok(verdict) => verdict.into(),
        Err(e) => {
            CliConsole.error(&format!("{:#}", e));
            Verdict::Broken.into()
        }
    }
}

/// Logs go to stderr so `--json` output on stdout stays machine-readable.
/// Set RUST_LOG=debug for verbose logging.
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
