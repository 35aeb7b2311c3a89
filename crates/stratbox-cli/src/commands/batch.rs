//! `stratbox batch`

use super::run::verdict_for;
use super::{Verdict, docker_orchestrator, label, read_source};
use crate::console::CliConsole;
use crate::signal_handler::SignalHandler;
use anyhow::Context;
use std::path::PathBuf;
use stratbox_core::{BatchSummary, ExecutionRequest, SandboxConfig};

pub async fn batch(
    config: SandboxConfig,
    files: &[PathBuf],
    concurrency: Option<usize>,
    json: bool,
) -> anyhow::Result<Verdict> {
    let mut requests = Vec::with_capacity(files.len());
    for (index, file) in files.iter().enumerate() {
        let id = format!("{}-{}", index, label(file));
        requests.push(ExecutionRequest::new(read_source(file)?).with_id(id));
    }

    let orchestrator = docker_orchestrator(config)?;
    let mut signals = SignalHandler::new();
    signals
        .start(orchestrator.clone())
        .context("Failed to install signal handler")?;
    orchestrator
        .prepare()
        .await
        .context("Container engine is not ready, try `stratbox doctor`")?;

    let results = orchestrator.execute_batch(requests, concurrency).await;
    if signals.interrupted() && !json {
        CliConsole.warn("Interrupted, unfinished strategies were cancelled");
    }
    let summary = BatchSummary::from_results(&results);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "summary": summary,
                "results": results,
            }))?
        );
    } else {
        let console = CliConsole;
        for (file, result) in files.iter().zip(&results) {
            console.print_result(&label(file), result);
        }
        console.print_header("Summary");
        println!(
            "{} total, {} succeeded, {} rejected, {} timed out, {} over limits",
            summary.total,
            summary.succeeded,
            summary.rejected,
            summary.timed_out,
            summary.resource_violated
        );
    }

    let verdicts: Vec<Verdict> = results.iter().map(verdict_for).collect();
    Ok(if verdicts.contains(&Verdict::Broken) {
        Verdict::Broken
    } else {
        Verdict::from_all(verdicts.iter().all(|v| *v == Verdict::Passed))
    })
}
