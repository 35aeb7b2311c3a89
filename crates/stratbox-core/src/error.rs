//! Error types for the sandbox engine
//!
//! Guest outcomes (rejections, timeouts, crashes, resource violations) are
//! never errors; they are reported through
//! [`ExecutionResult`](crate::types::ExecutionResult). Only failures of the
//! sandbox's own infrastructure surface as a [`SandboxError`].

use crate::runtime::EngineError;
use std::time::Duration;
use thiserror::Error;

/// Result type for sandbox operations
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors raised by the sandbox infrastructure
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    /// The container engine failed or became unreachable
    #[error("Container engine error: {0}")]
    Engine(#[from] EngineError),

    /// Invalid configuration
    #[error("Invalid sandbox configuration: {0}")]
    Config(String),

    /// The request itself cannot be executed
    #[error("Invalid execution request: {0}")]
    InvalidRequest(String),

    /// Killing a timed-out container did not finish in time
    #[error("Container kill did not complete within {0:?}")]
    KillTimeout(Duration),

    /// A background task (monitor, batch worker) failed
    #[error("Sandbox task failed: {0}")]
    Task(String),

    /// Internal error
    #[error("Sandbox internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the failure came from the downstream container engine
    pub fn is_engine_failure(&self) -> bool {
        matches!(self, Self::Engine(_) | Self::KillTimeout(_))
    }
}

impl From<tokio::task::JoinError> for SandboxError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SandboxError::config("max_concurrent_containers must be > 0");
        assert!(err.to_string().contains("max_concurrent_containers"));

        let err = SandboxError::KillTimeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: SandboxError = EngineError::Unavailable("daemon not running".into()).into();
        assert!(err.is_engine_failure());
        assert!(err.to_string().contains("daemon not running"));

        assert!(!SandboxError::internal("oops").is_engine_failure());
    }
}
