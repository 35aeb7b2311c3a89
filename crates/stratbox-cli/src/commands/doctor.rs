//! `stratbox doctor`

use super::{Verdict, docker_orchestrator};
use crate::console::CliConsole;
use colored::*;
use stratbox_core::SandboxConfig;

pub async fn doctor(config: SandboxConfig) -> anyhow::Result<Verdict> {
    let console = CliConsole;
    console.print_header("Stratbox Health Check");

    let image = config.runtime.image.clone();
    let binary = config.runtime.engine_binary.clone();
    let orchestrator = docker_orchestrator(config)?;
    console.success("Configuration is valid");

    let engine = orchestrator.runtime().engine();
    if let Err(e) = engine.ping().await {
        console.error(&format!("Engine '{}' is not reachable: {}", binary, e));
        println!("  {}", "Is the daemon running and is the user allowed to use it?".dimmed());
        return Ok(Verdict::Broken);
    }
    console.success(&format!("Engine '{}' is reachable", binary));

    if let Err(e) = engine.ensure_image(&image).await {
        console.error(&format!("Image '{}' is not available: {}", image, e));
        println!(
            "  {}",
            format!("Pull it with `{} pull {}`", binary, image).dimmed()
        );
        return Ok(Verdict::Broken);
    }
    console.success(&format!("Image '{}' is present", image));

    let limits = &orchestrator.config().runtime;
    println!(
        "  {}",
        format!(
            "memory {} MiB, cpus {:.2}, time limit {:?}, {} concurrent container(s)",
            limits.default_memory_bytes / (1024 * 1024),
            limits.default_cpu_fraction,
            limits.default_time_limit,
            orchestrator.config().orchestrator.max_concurrent_containers
        )
        .dimmed()
    );
    Ok(Verdict::Passed)
}
