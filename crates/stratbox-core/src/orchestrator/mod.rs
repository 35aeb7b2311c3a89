//! Sandbox orchestration
//!
//! [`SandboxOrchestrator`] is the single entry point. Each request runs
//! validate → launch → monitor and run → collect → clean up as an explicit
//! state machine, recorded on the result. A counting semaphore bounds how many
//! containers exist at once.

mod state;
mod stats;

pub use state::ExecutionState;
pub use stats::{BatchSummary, OrchestratorStats};

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::monitor::{LimitBreach, MonitorLimits, ResourceMonitor};
use crate::runtime::{ContainerEngine, ContainerRuntime, SubmitOutcome};
use crate::types::{ExecutionRequest, ExecutionResult, ExecutionStatus, RequestId};
use crate::validation::StaticValidator;
use dashmap::DashMap;
use futures::StreamExt;
use state::StateTrace;
use stats::{ActiveContainer, Counters};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Runs untrusted programs through validation and container isolation
#[derive(Clone)]
pub struct SandboxOrchestrator {
    validator: StaticValidator,
    runtime: ContainerRuntime,
    monitor: ResourceMonitor,
    config: Arc<SandboxConfig>,
    limiter: Arc<Semaphore>,
    counters: Arc<Counters>,
    root: CancellationToken,
    in_flight: Arc<DashMap<RequestId, Vec<Registration>>>,
    registrations: Arc<AtomicU64>,
}

/// One running request's cancellation handle, tagged so that runs sharing an
/// id only ever remove their own entry
type Registration = (u64, CancellationToken);

/// How the running phase ended
enum RunEnd {
    Finished(SandboxResult<SubmitOutcome>),
    Violation(LimitBreach),
    Backstop,
    Cancelled,
}

impl SandboxOrchestrator {
    /// Create an orchestrator over `engine`
    pub fn new(config: SandboxConfig, engine: Arc<dyn ContainerEngine>) -> SandboxResult<Self> {
        config.validate()?;
        let validator = StaticValidator::new(config.validation.clone());
        let runtime = ContainerRuntime::new(Arc::clone(&engine), config.runtime.clone());
        let monitor = ResourceMonitor::new(engine, config.monitor.clone());
        let limiter = Arc::new(Semaphore::new(
            config.orchestrator.max_concurrent_containers,
        ));
        Ok(Self {
            validator,
            runtime,
            monitor,
            config: Arc::new(config),
            limiter,
            counters: Arc::new(Counters::default()),
            root: CancellationToken::new(),
            in_flight: Arc::new(DashMap::new()),
            registrations: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Create an orchestrator driving the docker CLI
    pub fn docker(config: SandboxConfig) -> SandboxResult<Self> {
        let engine = Arc::new(crate::runtime::DockerEngine::from_config(&config.runtime));
        Self::new(config, engine)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn validator(&self) -> &StaticValidator {
        &self.validator
    }

    pub fn runtime(&self) -> &ContainerRuntime {
        &self.runtime
    }

    /// Current counters
    pub fn stats(&self) -> OrchestratorStats {
        self.counters.snapshot()
    }

    /// Check the engine and image before taking traffic
    pub async fn prepare(&self) -> SandboxResult<()> {
        self.runtime.prepare().await
    }

    /// Run one request to completion
    ///
    /// Guest outcomes are returned as results. `Err` means the sandbox itself
    /// failed, reported after cleanup was attempted.
    pub async fn execute(&self, request: ExecutionRequest) -> SandboxResult<ExecutionResult> {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Run one request, stopping early when `cancel` fires
    ///
    /// A cancelled request goes through the same cleanup as a timeout and
    /// yields a `Cancelled` result.
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> SandboxResult<ExecutionResult> {
        let (result, failure) = self.run_request(request, cancel).await;
        match failure {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Run many requests with at most `concurrency` in flight
    ///
    /// Results come back in input order. A failing request never aborts the
    /// batch; sandbox failures become `InternalError` results.
    pub async fn execute_batch(
        &self,
        requests: Vec<ExecutionRequest>,
        concurrency: Option<usize>,
    ) -> Vec<ExecutionResult> {
        let concurrency = concurrency
            .unwrap_or(self.config.orchestrator.max_concurrent_containers)
            .max(1);
        info!(requests = requests.len(), concurrency, "Starting batch");

        let jobs = requests.into_iter().map(|request| {
            let this = self.clone();
            let counters = Arc::clone(&self.counters);
            async move {
                let id = request.id.clone();
                let task = tokio::spawn(async move {
                    this.run_request(request, CancellationToken::new()).await.0
                });
                match task.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(request_id = %id, error = %e, "Batch task failed");
                        let mut result = ExecutionResult::new(id);
                        result.error = Some(SandboxError::from(e).to_string());
                        counters.record(result.status);
                        result
                    }
                }
            }
        });
        let results: Vec<ExecutionResult> = futures::stream::iter(jobs)
            .buffered(concurrency)
            .collect()
            .await;

        let summary = BatchSummary::from_results(&results);
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            rejected = summary.rejected,
            timed_out = summary.timed_out,
            resource_violated = summary.resource_violated,
            "Batch finished"
        );
        results
    }

    /// Cancel every in-flight request carrying `id`
    pub fn cancel(&self, id: &RequestId) -> bool {
        match self.in_flight.get(id) {
            Some(runs) => {
                info!(request_id = %id, runs = runs.len(), "Cancelling request");
                for (_, token) in runs.iter() {
                    token.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight and future request
    pub fn shutdown(&self) {
        info!(in_flight = self.in_flight.len(), "Shutting down orchestrator");
        self.root.cancel();
    }

    /// Whether [`SandboxOrchestrator::shutdown`] was called
    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Ids of requests currently executing
    pub fn in_flight(&self) -> Vec<RequestId> {
        self.in_flight.iter().map(|e| e.key().clone()).collect()
    }

    async fn run_request(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> (ExecutionResult, Option<SandboxError>) {
        let span = info_span!("execute", request_id = %request.id);
        let local = self.root.child_token();
        let generation = self.registrations.fetch_add(1, Ordering::Relaxed);
        self.in_flight
            .entry(request.id.clone())
            .or_default()
            .push((generation, local.clone()));
        let _registration = InFlight {
            map: &self.in_flight,
            id: request.id.clone(),
            generation,
        };
        self.counters.request_received();

        let (result, failure) = self
            .pipeline(request, Cancellation { caller: cancel, local })
            .instrument(span)
            .await;
        self.counters.record(result.status);
        (result, failure)
    }

    async fn pipeline(
        &self,
        request: ExecutionRequest,
        cancel: Cancellation,
    ) -> (ExecutionResult, Option<SandboxError>) {
        let mut result = ExecutionResult::new(request.id.clone());
        let mut trace = StateTrace::new();

        // Validation
        trace.advance(ExecutionState::Validating);
        let bypass = request.bypass_validation && self.config.orchestrator.allow_validation_bypass;
        if request.bypass_validation && !bypass {
            warn!("Validation bypass requested but not allowed, validating");
        }
        if bypass {
            warn!("Static validation bypassed");
        } else {
            let report = self.validator.validate(&request.source_code);
            if !report.safe() {
                info!(score = report.score(), issues = report.issues().len(), "Request rejected");
                trace.advance(ExecutionState::Rejected);
                trace.advance(ExecutionState::Done);
                result.status = ExecutionStatus::ValidationRejected;
                result.validation_report = Some(report);
                result.states = trace.into_states();
                return (result, None);
            }
            debug!(score = report.score(), "Request validated");
            result.validation_report = Some(report);
        }
        trace.advance(ExecutionState::Validated);

        // Wait for a container slot
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.limiter).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            trace.advance(ExecutionState::Cancelled);
            trace.advance(ExecutionState::Done);
            result.status = ExecutionStatus::Cancelled;
            result.error = Some("cancelled before launch".to_string());
            result.states = trace.into_states();
            return (result, None);
        };

        // Launch; not interruptible so a created container always gets a handle
        trace.advance(ExecutionState::Launching);
        let constraints = self
            .runtime
            .constraints_for(request.memory_limit_bytes, request.cpu_fraction);
        let image = request
            .image
            .clone()
            .unwrap_or_else(|| self.config.runtime.image.clone());
        let labels = vec![("stratbox.request".to_string(), request.id.to_string())];
        let handle = match self
            .runtime
            .launch_with_labels(&image, constraints, labels)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Container launch failed");
                trace.advance(ExecutionState::Failed);
                trace.advance(ExecutionState::Done);
                result.error = Some(e.to_string());
                result.states = trace.into_states();
                return (result, Some(e));
            }
        };
        let _active = ActiveContainer::enter(&self.counters);
        result.container_id = Some(handle.id().as_str().to_string());

        // Run under the monitor
        trace.advance(ExecutionState::Running);
        let time_limit = self.time_limit_for(&request);
        let backstop = time_limit + self.config.runtime.kill_grace + self.config.runtime.command_timeout;
        let limits = MonitorLimits::from_constraints(handle.constraints(), &self.config.monitor);
        let mut monitor = self
            .monitor
            .attach(&handle, self.config.monitor.sample_interval, limits);
        let kill_on_violation = self.config.orchestrator.kill_on_violation;

        let started = Instant::now();
        let end = {
            let submit = self.runtime.submit(
                &handle,
                &request.source_code,
                &request.input_payload,
                time_limit,
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => RunEnd::Cancelled,
                breach = monitor.violation(), if kill_on_violation => RunEnd::Violation(breach),
                _ = tokio::time::sleep(backstop) => RunEnd::Backstop,
                outcome = submit => RunEnd::Finished(outcome),
            }
        };
        let elapsed = started.elapsed();

        if !matches!(end, RunEnd::Finished(_)) {
            if let Err(e) = self.runtime.kill(&handle).await {
                warn!(error = %e, "Failed to kill container");
            }
        }
        result.resource_usage = monitor.detach().await;
        let failure = self.classify(end, elapsed, &mut result, &mut trace);

        // Cleanup always runs once a container exists
        trace.advance(ExecutionState::CleaningUp);
        if let Err(e) = self.runtime.destroy(&handle).await {
            self.counters.cleanup_failed();
            if result.error.is_none() {
                result.error = Some(format!("cleanup failed: {}", e));
            }
        }
        drop(handle);
        drop(permit);
        trace.advance(ExecutionState::Done);
        result.states = trace.into_states();

        info!(
            status = %result.status,
            exit_code = ?result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            memory_peak = result.resource_usage.memory_bytes_peak,
            "Request finished"
        );
        (result, failure)
    }

    fn classify(
        &self,
        end: RunEnd,
        elapsed: Duration,
        result: &mut ExecutionResult,
        trace: &mut StateTrace,
    ) -> Option<SandboxError> {
        result.duration = elapsed;
        let violated = result.resource_usage.violated;

        let (status, state, failure) = match end {
            RunEnd::Cancelled => {
                result.error = Some("cancelled by caller".to_string());
                (ExecutionStatus::Cancelled, ExecutionState::Cancelled, None)
            }
            RunEnd::Violation(breach) => {
                warn!(breach = %breach, "Container killed for resource violation");
                result.error = Some(breach.to_string());
                (
                    ExecutionStatus::ResourceViolation,
                    ExecutionState::ResourceViolated,
                    None,
                )
            }
            RunEnd::Backstop => {
                warn!("Hard deadline reached before the guest deadline resolved");
                result.error = Some("hard deadline exceeded".to_string());
                (ExecutionStatus::Timeout, ExecutionState::TimedOut, None)
            }
            RunEnd::Finished(Err(e)) => {
                error!(error = %e, "Guest execution failed");
                result.error = Some(e.to_string());
                (
                    ExecutionStatus::InternalError,
                    ExecutionState::Failed,
                    Some(e),
                )
            }
            RunEnd::Finished(Ok(outcome)) => {
                result.duration = outcome.duration;
                result.stdout = outcome.stdout;
                result.stderr = outcome.stderr;
                result.exit_code = outcome.exit_code;
                result.output_truncated = outcome.output_truncated;
                if outcome.timed_out {
                    (ExecutionStatus::Timeout, ExecutionState::TimedOut, None)
                } else if outcome.oom_killed || violated {
                    if let Some(breach) = result.resource_usage.first_breach() {
                        result.error = Some(breach.to_string());
                    } else {
                        result.error = Some("killed by the memory limit".to_string());
                    }
                    (
                        ExecutionStatus::ResourceViolation,
                        ExecutionState::ResourceViolated,
                        None,
                    )
                } else if outcome.exit_code == Some(0) {
                    (ExecutionStatus::Success, ExecutionState::Completed, None)
                } else {
                    (ExecutionStatus::RuntimeError, ExecutionState::Crashed, None)
                }
            }
        };
        result.status = status;
        trace.advance(state);
        failure
    }

    fn time_limit_for(&self, request: &ExecutionRequest) -> Duration {
        let runtime = &self.config.runtime;
        match request.time_limit {
            Some(limit) if limit > runtime.max_time_limit => {
                warn!(
                    requested_ms = limit.as_millis() as u64,
                    max_ms = runtime.max_time_limit.as_millis() as u64,
                    "Time limit clamped"
                );
                runtime.max_time_limit
            }
            Some(limit) => limit,
            None => runtime.default_time_limit,
        }
    }
}

impl std::fmt::Debug for SandboxOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxOrchestrator")
            .field("runtime", &self.runtime)
            .field("available_slots", &self.limiter.available_permits())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

/// Caller and orchestrator cancellation for one request
struct Cancellation {
    caller: CancellationToken,
    local: CancellationToken,
}

impl Cancellation {
    async fn cancelled(&self) {
        tokio::select! {
            _ = self.caller.cancelled() => {}
            _ = self.local.cancelled() => {}
        }
    }
}

/// Removes a run from the in-flight map when it finishes or is dropped
struct InFlight<'a> {
    map: &'a DashMap<RequestId, Vec<Registration>>,
    id: RequestId,
    generation: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(mut runs) = self.map.get_mut(&self.id) {
            runs.retain(|(generation, _)| *generation != self.generation);
        }
        self.map.remove_if(&self.id, |_, runs| runs.is_empty());
    }
}
