//! CLI argument definitions using clap
//!
//! - stratbox validate <FILE>...      # Static checks only, nothing runs
//! - stratbox run <FILE>              # Validate and run one strategy
//! - stratbox batch <FILE>...         # Run many strategies concurrently
//! - stratbox doctor                  # Check engine and image

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "stratbox")]
#[command(about = "Validate and run untrusted strategy code in locked-down containers")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML, YAML or JSON configuration file
    #[arg(long, global = true, env = "STRATBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format (logs go to stderr)
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Statically validate strategy files without running them
    Validate {
        /// Source files to check
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Use the strict validation policy
        #[arg(long)]
        strict: bool,

        /// Print reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate and run one strategy in a container
    Run {
        /// Strategy source file
        file: PathBuf,

        /// File whose bytes are piped to the strategy's stdin
        #[arg(long)]
        input: Option<PathBuf>,

        /// Wall-clock limit, e.g. `5s` or `1m`
        #[arg(long, value_parser = parse_duration)]
        time_limit: Option<Duration>,

        /// Memory cap in MiB
        #[arg(long)]
        memory_mb: Option<u64>,

        /// CPU share, e.g. `0.5` for half a core
        #[arg(long)]
        cpus: Option<f64>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run many strategies with bounded concurrency
    Batch {
        /// Strategy source files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Containers alive at once (defaults to the configured maximum)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the container engine is reachable and the image is present
    Doctor,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}
