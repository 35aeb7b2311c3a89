//! The downstream container engine boundary.
//!
//! Everything the sandbox needs from a container engine goes through
//! [`ContainerEngine`]. The production implementation shells out to the
//! `docker` CLI; tests substitute scripted in-process engines.

use super::constraints::ContainerConstraints;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-assigned container identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, as the docker CLI displays ids
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short())
    }
}

/// Everything needed to create one container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name, unique per launch
    pub name: String,
    /// Image reference
    pub image: String,
    /// Hard resource caps enforced by the engine
    pub constraints: ContainerConstraints,
    /// Mount point of the writable scratch area
    pub scratch_dir: String,
    /// Labels attached to the container
    pub labels: Vec<(String, String)>,
}

/// Captured result of a command run inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecOutput {
    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

/// Point-in-time resource accounting for a container
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceStats {
    /// CPU usage; 100.0 is one full core
    pub cpu_percent: f64,
    /// Resident memory charged to the container
    pub memory_bytes: u64,
    /// Live processes and threads
    pub pids: u32,
    /// Cumulative block I/O operations, when the engine can report them
    pub io_ops: Option<u64>,
}

/// Failures of the container engine itself
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected engine output: {0}")]
    Parse(String),

    #[error("engine I/O error: {0}")]
    Io(String),

    #[error("engine command `{0}` timed out")]
    Timeout(String),
}

impl EngineError {
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Client for a container engine
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &'static str;

    /// Check that the engine is reachable
    async fn ping(&self) -> Result<(), EngineError>;

    /// Make sure `image` is available locally
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError>;

    /// Create and start an idle container
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError>;

    /// Write `contents` to `path` inside the container
    async fn write_file(
        &self,
        id: &ContainerId,
        path: &str,
        contents: &[u8],
    ) -> Result<(), EngineError>;

    /// Run `command` inside the container, feeding `stdin` and capturing at
    /// most `max_output_bytes` of each output stream
    ///
    /// Dropping the returned future must stop the local client process.
    async fn exec(
        &self,
        id: &ContainerId,
        command: &[String],
        stdin: &[u8],
        max_output_bytes: usize,
    ) -> Result<ExecOutput, EngineError>;

    /// Sample current resource usage
    async fn stats(&self, id: &ContainerId) -> Result<ResourceStats, EngineError>;

    /// Send SIGKILL to every process in the container
    async fn kill(&self, id: &ContainerId) -> Result<(), EngineError>;

    /// Remove the container and everything it holds; succeeds if already gone
    async fn remove(&self, id: &ContainerId) -> Result<(), EngineError>;
}
