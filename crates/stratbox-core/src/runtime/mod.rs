//! Isolated container lifecycle
//!
//! One container per request: [`ContainerRuntime::launch`] creates it locked
//! down, [`ContainerRuntime::submit`] runs the guest under a deadline and
//! [`ContainerRuntime::destroy`] tears it down. The returned
//! [`ContainerHandle`] guarantees removal happens exactly once, falling back
//! to a background removal from `Drop` when a caller never got to destroy it.

mod constraints;
mod docker;
mod engine;

pub use constraints::ContainerConstraints;
pub use docker::{
    DockerEngine, build_run_args, parse_io_stat, parse_size, parse_stats_line, read_capped,
    validate_image_name,
};
pub use engine::{
    ContainerEngine, ContainerId, ContainerSpec, EngineError, ExecOutput, ResourceStats,
};

use crate::config::RuntimeConfig;
use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Exit status of a process killed by SIGKILL (128 + 9)
pub const SIGKILL_EXIT_CODE: i32 = 137;

/// File name the guest source is written to inside the scratch area
pub const SCRIPT_NAME: &str = "strategy.py";

/// What came back from running the guest once
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `None` when killed by signal or by the deadline
    pub exit_code: Option<i32>,
    /// The deadline fired and the container was killed
    pub timed_out: bool,
    /// The engine's memory cap killed the guest
    pub oom_killed: bool,
    /// At least one output stream hit the capture cap
    pub output_truncated: bool,
    /// Wall time from start of execution to completion or kill
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl SubmitOutcome {
    fn timed_out(duration: Duration) -> Self {
        Self {
            timed_out: true,
            duration,
            ..Default::default()
        }
    }

    /// Guest exited normally with status zero
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.oom_killed && self.exit_code == Some(0)
    }
}

/// Exclusive ownership of one running container
///
/// Not `Clone`: a container belongs to exactly one request. Removal runs at
/// most once whether it comes from [`ContainerHandle::destroy`] or `Drop`.
pub struct ContainerHandle {
    id: ContainerId,
    name: String,
    constraints: ContainerConstraints,
    engine: Arc<dyn ContainerEngine>,
    destroyed: AtomicBool,
}

impl ContainerHandle {
    fn new(
        id: ContainerId,
        name: String,
        constraints: ContainerConstraints,
        engine: Arc<dyn ContainerEngine>,
    ) -> Self {
        Self {
            id,
            name,
            constraints,
            engine,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn constraints(&self) -> &ContainerConstraints {
        &self.constraints
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Remove the container
    ///
    /// Returns `Ok(false)` when the handle was already destroyed.
    pub async fn destroy(&self) -> Result<bool, EngineError> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.engine.remove(&self.id).await?;
        debug!(container = %self.id, "Container removed");
        Ok(true)
    }
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(container = %self.id, "Handle dropped without destroy, scheduling removal");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let engine = Arc::clone(&self.engine);
                let id = self.id.clone();
                runtime.spawn(async move {
                    if let Err(e) = engine.remove(&id).await {
                        error!(container = %id, error = %e, "Background container removal failed");
                    }
                });
            }
            Err(_) => {
                error!(container = %self.id, name = %self.name, "No async runtime, container leaked");
            }
        }
    }
}

/// Container lifecycle over a [`ContainerEngine`]
#[derive(Clone)]
pub struct ContainerRuntime {
    engine: Arc<dyn ContainerEngine>,
    config: Arc<RuntimeConfig>,
}

impl ContainerRuntime {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: RuntimeConfig) -> Self {
        Self {
            engine,
            config: Arc::new(config),
        }
    }

    /// Runtime backed by the docker CLI named in `config`
    pub fn docker(config: RuntimeConfig) -> Self {
        let engine = Arc::new(DockerEngine::from_config(&config));
        Self::new(engine, config)
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Check the engine is reachable and the configured image is present
    pub async fn prepare(&self) -> SandboxResult<()> {
        self.engine.ping().await?;
        self.engine.ensure_image(&self.config.image).await?;
        info!(engine = self.engine.name(), image = %self.config.image, "Container engine ready");
        Ok(())
    }

    /// Constraints for a request, clamped to configured ceilings
    pub fn constraints_for(
        &self,
        memory_bytes: Option<u64>,
        cpu_fraction: Option<f64>,
    ) -> ContainerConstraints {
        ContainerConstraints::for_request(&self.config, memory_bytes, cpu_fraction)
    }

    /// Create an idle, locked-down container
    pub async fn launch(
        &self,
        image: &str,
        constraints: ContainerConstraints,
    ) -> SandboxResult<ContainerHandle> {
        self.launch_with_labels(image, constraints, Vec::new()).await
    }

    /// Create a container carrying extra labels
    pub async fn launch_with_labels(
        &self,
        image: &str,
        constraints: ContainerConstraints,
        mut labels: Vec<(String, String)>,
    ) -> SandboxResult<ContainerHandle> {
        constraints.validate()?;

        let name = format!("stratbox-{}", Uuid::new_v4());
        labels.push(("stratbox.managed".to_string(), "true".to_string()));
        let spec = ContainerSpec {
            name: name.clone(),
            image: image.to_string(),
            constraints,
            scratch_dir: self.config.scratch_dir.clone(),
            labels,
        };

        let id = self.engine.create(&spec).await?;
        info!(
            container = %id,
            name = %name,
            memory_bytes = spec.constraints.memory_bytes,
            cpus = spec.constraints.cpu_fraction,
            "Container launched"
        );
        Ok(ContainerHandle::new(
            id,
            name,
            spec.constraints,
            Arc::clone(&self.engine),
        ))
    }

    /// Run `source` in the container with `input` on stdin
    ///
    /// Blocks until the guest exits or `time_limit` elapses. On expiry the
    /// container is killed and the outcome is marked timed out.
    pub async fn submit(
        &self,
        handle: &ContainerHandle,
        source: &str,
        input: &[u8],
        time_limit: Duration,
    ) -> SandboxResult<SubmitOutcome> {
        if handle.is_destroyed() {
            return Err(SandboxError::invalid_request(format!(
                "container {} was already destroyed",
                handle.id()
            )));
        }

        let script = format!(
            "{}/{}",
            self.config.scratch_dir.trim_end_matches('/'),
            SCRIPT_NAME
        );
        self.engine
            .write_file(handle.id(), &script, source.as_bytes())
            .await?;

        let mut command = self.config.interpreter.clone();
        command.push(script);

        let started = Instant::now();
        let exec = self
            .engine
            .exec(handle.id(), &command, input, self.config.max_output_bytes);

        match tokio::time::timeout(time_limit, exec).await {
            Ok(Ok(output)) => {
                let duration = started.elapsed();
                let oom_killed = output.exit_code == Some(SIGKILL_EXIT_CODE);
                debug!(
                    container = %handle.id(),
                    exit_code = ?output.exit_code,
                    duration_ms = duration.as_millis() as u64,
                    "Guest finished"
                );
                Ok(SubmitOutcome {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.exit_code,
                    timed_out: false,
                    oom_killed,
                    output_truncated: output.truncated(),
                    duration,
                })
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(
                    container = %handle.id(),
                    limit_ms = time_limit.as_millis() as u64,
                    "Deadline exceeded, killing container"
                );
                if let Err(e) = self.kill(handle).await {
                    warn!(container = %handle.id(), error = %e, "Kill after deadline failed");
                }
                Ok(SubmitOutcome::timed_out(started.elapsed()))
            }
        }
    }

    /// SIGKILL every process in the container, bounded by `kill_grace`
    pub async fn kill(&self, handle: &ContainerHandle) -> SandboxResult<()> {
        let grace = self.config.kill_grace;
        match tokio::time::timeout(grace, self.engine.kill(handle.id())).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SandboxError::KillTimeout(grace)),
        }
    }

    /// Remove the container; a second call is a no-op
    pub async fn destroy(&self, handle: &ContainerHandle) -> SandboxResult<()> {
        match handle.destroy().await {
            Ok(true) => {
                info!(container = %handle.id(), "Container destroyed");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                error!(container = %handle.id(), error = %e, "Container removal failed");
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRuntime")
            .field("engine", &self.engine.name())
            .field("image", &self.config.image)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod mock;
