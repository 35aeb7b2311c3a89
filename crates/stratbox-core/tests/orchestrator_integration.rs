//! End-to-end orchestrator behaviour over a scripted engine

mod common;

use common::{FakeEngine, GuestRun};
use std::sync::Arc;
use std::time::Duration;
use stratbox_core::{
    ExecutionRequest, ExecutionState, ExecutionStatus, RuleId, SandboxConfig, SandboxError,
    SandboxOrchestrator, ValidationPolicy,
};
use tokio_util::sync::CancellationToken;

fn orchestrator(engine: &Arc<FakeEngine>, config: SandboxConfig) -> SandboxOrchestrator {
    common::init_tracing();
    SandboxOrchestrator::new(config, engine.clone()).unwrap()
}

/// Tiny stand-in interpreter for the programs used below
fn interpreter(source: &str, input: &[u8]) -> GuestRun {
    if source.contains("while True") {
        GuestRun::Hang
    } else if source.contains("bytearray") {
        GuestRun::MemoryHog(1024 * 1024 * 1024)
    } else if source.contains("raise") {
        GuestRun::failure("Traceback (most recent call last):\nValueError\n", 1)
    } else if source.contains("sys.stdin") {
        GuestRun::stdout(format!("{}\n", input.len()))
    } else if source.contains("2 + 3 * 4") {
        GuestRun::stdout("14\n")
    } else {
        GuestRun::stdout("")
    }
}

#[tokio::test]
async fn test_forbidden_module_is_rejected_by_name() {
    let engine = FakeEngine::new(interpreter).into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());

    let result = orchestrator
        .execute(ExecutionRequest::new(
            "import subprocess\nsubprocess.run(['id'])\n",
        ))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::ValidationRejected);
    let report = result.validation_report.as_ref().unwrap();
    assert!(!report.safe());
    assert!(
        report
            .issues()
            .iter()
            .any(|i| i.rule_id == RuleId::ForbiddenImport && i.message.contains("subprocess"))
    );
    assert_eq!(engine.created(), 0);
}

#[tokio::test]
async fn test_trivial_arithmetic_succeeds() {
    let engine = FakeEngine::new(interpreter).into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());

    let result = orchestrator
        .execute(ExecutionRequest::new("print(2 + 3 * 4)\n"))
        .await
        .unwrap();

    let report = result.validation_report.as_ref().unwrap();
    assert!(report.safe());
    assert_eq!(report.score(), 0);
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.stdout, "14\n");
    assert!(result.resource_usage.sample_count >= 1);
    assert!(engine.all_destroyed_once());
}

#[tokio::test(start_paused = true)]
async fn test_infinite_loop_times_out() {
    let engine = FakeEngine::new(interpreter).into_arc();
    let config = SandboxConfig::default();
    let grace = config.runtime.kill_grace;
    let orchestrator = orchestrator(&engine, config);

    let started = tokio::time::Instant::now();
    let result = orchestrator
        .execute(
            ExecutionRequest::new("while True:\n    pass\n").with_time_limit(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(result.states.contains(&ExecutionState::TimedOut));
    assert!(result.duration >= Duration::from_secs(2));
    assert!(result.duration < Duration::from_secs(2) + grace);
    assert!(elapsed < Duration::from_secs(2) + grace);
    assert_eq!(engine.kills(), 1);
    assert!(engine.all_destroyed_once());
}

#[tokio::test]
async fn test_dynamic_evaluation_is_cited() {
    let engine = FakeEngine::new(interpreter).into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());

    let result = orchestrator
        .execute(ExecutionRequest::new("code = '1 + 1'\nprint(eval(code))\n"))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::ValidationRejected);
    let report = result.validation_report.as_ref().unwrap();
    let issue = report
        .issues()
        .iter()
        .find(|i| i.rule_id == RuleId::ForbiddenCall)
        .unwrap();
    assert!(issue.message.contains("eval"));
    assert_eq!(issue.line, Some(2));
    assert_eq!(engine.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_batch_respects_concurrency_cap() {
    let engine = FakeEngine::new(interpreter)
        .with_exec_delay(Duration::from_millis(200))
        .into_arc();
    let mut config = SandboxConfig::default();
    config.orchestrator.max_concurrent_containers = 5;
    let orchestrator = orchestrator(&engine, config);

    let requests: Vec<ExecutionRequest> = (0..20)
        .map(|i| ExecutionRequest::new("print(2 + 3 * 4)\n").with_id(format!("req-{i}")))
        .collect();
    let results = orchestrator.execute_batch(requests, None).await;

    assert_eq!(results.len(), 20);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.request_id.as_str(), format!("req-{i}"));
        assert_eq!(result.status, ExecutionStatus::Success);
    }
    assert_eq!(engine.created(), 20);
    assert!(engine.peak_alive() <= 5, "peak {}", engine.peak_alive());
    assert!(engine.all_destroyed_once());

    let stats = orchestrator.stats();
    assert_eq!(stats.total, 20);
    assert_eq!(stats.succeeded, 20);
    assert!(stats.peak_active_containers <= 5);
    assert_eq!(stats.active_containers, 0);
}

#[tokio::test(start_paused = true)]
async fn test_mixed_batch_is_independent() {
    let engine = FakeEngine::new(interpreter).into_arc();
    let mut config = SandboxConfig::default();
    config.runtime.default_time_limit = Duration::from_secs(1);
    let orchestrator = orchestrator(&engine, config);

    let results = orchestrator
        .execute_batch(
            vec![
                ExecutionRequest::new("print(2 + 3 * 4)\n"),
                ExecutionRequest::new("import os\n"),
                ExecutionRequest::new("while True:\n    pass\n"),
                ExecutionRequest::new("raise ValueError('x')\n"),
            ],
            Some(2),
        )
        .await;

    let statuses: Vec<ExecutionStatus> = results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            ExecutionStatus::Success,
            ExecutionStatus::ValidationRejected,
            ExecutionStatus::Timeout,
            ExecutionStatus::RuntimeError,
        ]
    );
    assert!(results[3].stderr.contains("ValueError"));
    assert_eq!(engine.created(), 3);
    assert!(engine.all_destroyed_once());

    let stats = orchestrator.stats();
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.runtime_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_memory_hog_is_a_resource_violation() {
    let engine = FakeEngine::new(interpreter).into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());

    let result = orchestrator
        .execute(
            ExecutionRequest::new("data = bytearray(10**9)\n")
                .with_time_limit(Duration::from_secs(30)),
        )
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::ResourceViolation);
    assert!(result.resource_usage.violated);
    assert!(result.error.as_deref().unwrap().contains("memory"));
    assert!(result.duration < Duration::from_secs(30));
    assert_eq!(engine.kills(), 1);
    assert!(engine.all_destroyed_once());
}

#[tokio::test]
async fn test_oom_kill_is_a_resource_violation() {
    let engine = FakeEngine::new(|_, _| GuestRun::OomKill).into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());

    let result = orchestrator
        .execute(ExecutionRequest::new("values = [0] * 10\n"))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::ResourceViolation);
    assert_eq!(result.exit_code, Some(137));
    assert!(engine.all_destroyed_once());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_cleans_up() {
    let engine = FakeEngine::new(interpreter).into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());
    let cancel = CancellationToken::new();

    let running = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .execute_with_cancel(
                    ExecutionRequest::new("while True:\n    pass\n")
                        .with_time_limit(Duration::from_secs(60)),
                    cancel,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(orchestrator.in_flight().len(), 1);
    cancel.cancel();

    let result = running.await.unwrap().unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(result.states.contains(&ExecutionState::CleaningUp));
    assert!(result.duration < Duration::from_secs(60));
    assert_eq!(engine.kills(), 1);
    assert!(engine.all_destroyed_once());
    assert!(orchestrator.in_flight().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_by_request_id() {
    let engine = FakeEngine::new(interpreter).into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());

    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .execute(
                    ExecutionRequest::new("while True:\n    pass\n")
                        .with_id("long-runner")
                        .with_time_limit(Duration::from_secs(60)),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(orchestrator.cancel(&"long-runner".into()));

    let result = running.await.unwrap().unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(engine.all_destroyed_once());
    assert_eq!(orchestrator.stats().cancelled, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reaches_every_run_sharing_an_id() {
    let engine = FakeEngine::new(interpreter).into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());

    let quick = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .execute(ExecutionRequest::new("print(2 + 3 * 4)\n").with_id("shared"))
                .await
        })
    };
    let slow = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .execute(
                    ExecutionRequest::new("while True:\n    pass\n")
                        .with_id("shared")
                        .with_time_limit(Duration::from_secs(60)),
                )
                .await
        })
    };

    let quick = quick.await.unwrap().unwrap();
    assert_eq!(quick.status, ExecutionStatus::Success);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(orchestrator.in_flight().len(), 1);
    assert_eq!(orchestrator.in_flight()[0].0, "shared");
    assert!(orchestrator.cancel(&"shared".into()));

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow.status, ExecutionStatus::Cancelled);
    assert!(slow.duration < Duration::from_secs(60));
    assert!(orchestrator.in_flight().is_empty());
    assert!(!orchestrator.cancel(&"shared".into()));
    assert!(engine.all_destroyed_once());
}

#[tokio::test(start_paused = true)]
async fn test_hung_engine_call_hits_hard_deadline() {
    let engine = FakeEngine::new(interpreter).hanging_write().into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());

    let result = orchestrator
        .execute(ExecutionRequest::new("print(1)\n").with_time_limit(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert_eq!(result.error.as_deref(), Some("hard deadline exceeded"));
    assert!(result.states.contains(&ExecutionState::TimedOut));
    assert!(result.states.contains(&ExecutionState::CleaningUp));
    assert_eq!(engine.kills(), 1);
    assert_eq!(engine.removals(), vec![1]);
    assert_eq!(orchestrator.stats().timed_out, 1);
}

#[tokio::test]
async fn test_panicking_run_is_counted_in_batch() {
    let engine = FakeEngine::printing("never").panicking_create().into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());

    let results = orchestrator
        .execute_batch(vec![ExecutionRequest::new("print(1)\n").with_id("doomed")], None)
        .await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ExecutionStatus::InternalError);
    assert!(results[0].error.is_some());

    let stats = orchestrator.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.internal_errors, 1);
    assert!(orchestrator.in_flight().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_execution_still_removes_container() {
    let engine = FakeEngine::new(interpreter).into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());

    let abandoned = tokio::time::timeout(
        Duration::from_secs(1),
        orchestrator.execute(
            ExecutionRequest::new("while True:\n    pass\n").with_time_limit(Duration::from_secs(60)),
        ),
    )
    .await;
    assert!(abandoned.is_err());

    for _ in 0..100 {
        if engine.alive() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(engine.all_destroyed_once());
    assert_eq!(orchestrator.stats().active_containers, 0);
    assert!(orchestrator.in_flight().is_empty());
}

#[tokio::test]
async fn test_same_program_same_result() {
    let engine = FakeEngine::new(interpreter).into_arc();
    let mut config = SandboxConfig::default();
    config.validation = ValidationPolicy::default().allow_import("sys");
    let orchestrator = orchestrator(&engine, config);
    let source = "import sys\ndata = sys.stdin.read()\nprint(len(data))\n";

    let first = orchestrator
        .execute(ExecutionRequest::new(source).with_input(b"[1, 2, 3]".to_vec()))
        .await
        .unwrap();
    let second = orchestrator
        .execute(ExecutionRequest::new(source).with_input(b"[1, 2, 3]".to_vec()))
        .await
        .unwrap();

    assert_eq!(first.status, ExecutionStatus::Success);
    assert_eq!(first.status, second.status);
    assert_eq!(first.stdout, "9\n");
    assert_eq!(first.stdout, second.stdout);
    assert_ne!(first.container_id, second.container_id);
    assert!(engine.all_destroyed_once());
}

#[tokio::test]
async fn test_engine_failure_surfaces_as_error() {
    let engine = FakeEngine::printing("never").failing_create().into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());

    let err = orchestrator
        .execute(ExecutionRequest::new("print(1)\n"))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Engine(_)));
    assert_eq!(engine.alive(), 0);
    assert_eq!(orchestrator.stats().internal_errors, 1);
}

#[tokio::test]
async fn test_container_is_labelled_and_constrained() {
    let engine = FakeEngine::new(interpreter).into_arc();
    let orchestrator = orchestrator(&engine, SandboxConfig::default());

    orchestrator
        .execute(
            ExecutionRequest::new("print(2 + 3 * 4)\n")
                .with_id("labelled")
                .with_memory_limit(128 * 1024 * 1024)
                .with_cpu_fraction(0.5),
        )
        .await
        .unwrap();

    let specs = engine.specs();
    assert_eq!(specs.len(), 1);
    let spec = &specs[0];
    assert!(
        spec.labels
            .iter()
            .any(|(k, v)| k == "stratbox.request" && v == "labelled")
    );
    assert_eq!(spec.constraints.memory_bytes, 128 * 1024 * 1024);
    assert_eq!(spec.constraints.cpu_fraction, 0.5);
    assert_eq!(spec.constraints.user, "65534:65534");
}
