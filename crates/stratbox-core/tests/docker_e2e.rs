//! Tests against a real docker daemon
//!
//! Ignored by default. Run with `cargo test -- --ignored` on a host where
//! `docker` works and `python:3.12-slim` can be pulled.

use std::time::Duration;
use stratbox_core::{ExecutionRequest, ExecutionStatus, SandboxConfig, SandboxOrchestrator};

fn docker_orchestrator() -> SandboxOrchestrator {
    let mut config = SandboxConfig::default();
    config.runtime.pull_missing_image = true;
    SandboxOrchestrator::docker(config).unwrap()
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_docker_runs_trivial_program() {
    let orchestrator = docker_orchestrator();
    orchestrator.prepare().await.unwrap();

    let result = orchestrator
        .execute(ExecutionRequest::new("print(2 + 3 * 4)\n"))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.error);
    assert_eq!(result.stdout, "14\n");
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_docker_kills_infinite_loop() {
    let orchestrator = docker_orchestrator();
    orchestrator.prepare().await.unwrap();

    let result = orchestrator
        .execute(
            ExecutionRequest::new("while True:\n    pass\n").with_time_limit(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(result.duration < Duration::from_secs(2) + orchestrator.config().runtime.kill_grace);
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_docker_memory_cap_is_enforced() {
    let orchestrator = docker_orchestrator();
    orchestrator.prepare().await.unwrap();

    let result = orchestrator
        .execute(
            ExecutionRequest::new("data = bytearray(512 * 1024 * 1024)\nprint(len(data))\n")
                .with_memory_limit(64 * 1024 * 1024),
        )
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::ResourceViolation);
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_docker_batch_leaves_no_containers() {
    let orchestrator = docker_orchestrator();
    orchestrator.prepare().await.unwrap();

    let requests = (0..6)
        .map(|i| ExecutionRequest::new(format!("print({i})\n")))
        .collect();
    let results = orchestrator.execute_batch(requests, Some(3)).await;
    assert!(results.iter().all(|r| r.status == ExecutionStatus::Success));

    let listing = tokio::process::Command::new("docker")
        .args(["ps", "--all", "--quiet", "--filter", "label=stratbox.managed=true"])
        .output()
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&listing.stdout).trim().is_empty());
}
