//! `stratbox run`

use super::{Verdict, docker_orchestrator, label, read_source};
use crate::console::CliConsole;
use crate::signal_handler::SignalHandler;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stratbox_core::{ExecutionRequest, ExecutionResult, ExecutionStatus, SandboxConfig};

const MIB: u64 = 1024 * 1024;

/// Options of a single run
#[derive(Debug, Default)]
pub struct RunOptions {
    pub input: Option<PathBuf>,
    pub time_limit: Option<Duration>,
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,
    pub json: bool,
}

pub async fn run(
    config: SandboxConfig,
    file: &Path,
    options: RunOptions,
) -> anyhow::Result<Verdict> {
    let request = build_request(file, &options)?;
    let orchestrator = docker_orchestrator(config)?;
    let mut signals = SignalHandler::new();
    signals
        .start(orchestrator.clone())
        .context("Failed to install signal handler")?;

    orchestrator
        .prepare()
        .await
        .context("Container engine is not ready, try `stratbox doctor`")?;
    let result = orchestrator
        .execute(request)
        .await
        .context("Sandbox failure")?;
    if signals.interrupted() && !options.json {
        CliConsole.warn("Interrupted, the run was cancelled");
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        CliConsole.print_result(&label(file), &result);
    }
    Ok(verdict_for(&result))
}

fn build_request(file: &Path, options: &RunOptions) -> anyhow::Result<ExecutionRequest> {
    let mut request = ExecutionRequest::new(read_source(file)?);
    if let Some(path) = &options.input {
        let payload = std::fs::read(path)
            .with_context(|| format!("Failed to read input file '{}'", path.display()))?;
        request = request.with_input(payload);
    }
    if let Some(limit) = options.time_limit {
        request = request.with_time_limit(limit);
    }
    if let Some(mb) = options.memory_mb {
        request = request.with_memory_limit(mb.saturating_mul(MIB));
    }
    if let Some(cpus) = options.cpus {
        request = request.with_cpu_fraction(cpus);
    }
    Ok(request)
}

pub(crate) fn verdict_for(result: &ExecutionResult) -> Verdict {
    match result.status {
        ExecutionStatus::Success => Verdict::Passed,
        ExecutionStatus::InternalError => Verdict::Broken,
        _ => Verdict::Failed,
    }
}
