//! Command routing logic for CLI

use crate::args::{Cli, Commands};
use crate::commands::run::RunOptions;
use crate::commands::{self, Verdict};
use anyhow::Context;
use stratbox_core::SandboxConfig;

/// Route CLI commands to their respective handlers
pub async fn route(cli: Cli) -> anyhow::Result<Verdict> {
    let config = SandboxConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load configuration from '{}'", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;

    match cli.command {
        Commands::Validate {
            files,
            strict,
            json,
        } => commands::validate::validate(&config, &files, strict, json),
        Commands::Run {
            file,
            input,
            time_limit,
            memory_mb,
            cpus,
            json,
        } => {
            let options = RunOptions {
                input,
                time_limit,
                memory_mb,
                cpus,
                json,
            };
            commands::run::run(config, &file, options).await
        }
        Commands::Batch {
            files,
            concurrency,
            json,
        } => commands::batch::batch(config, &files, concurrency, json).await,
        Commands::Doctor => commands::doctor::doctor(config).await,
    }
}
