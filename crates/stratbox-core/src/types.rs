//! Request and result types

use crate::monitor::ResourceSnapshot;
use crate::orchestrator::ExecutionState;
use crate::validation::ValidationReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for an execution request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::generate()
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One program to run
///
/// Unset limits take the configured defaults; set limits are clamped to the
/// configured ceilings. Network access is never available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub id: RequestId,
    pub source_code: String,
    #[serde(default, with = "humantime_serde")]
    pub time_limit: Option<Duration>,
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_fraction: Option<f64>,
    /// Bytes fed to the guest's stdin
    #[serde(default)]
    pub input_payload: Vec<u8>,
    /// Image override
    #[serde(default)]
    pub image: Option<String>,
    /// Skip static validation; honoured only when configuration allows it
    #[serde(default)]
    pub bypass_validation: bool,
}

impl ExecutionRequest {
    pub fn new(source_code: impl Into<String>) -> Self {
        Self {
            id: RequestId::generate(),
            source_code: source_code.into(),
            time_limit: None,
            memory_limit_bytes: None,
            cpu_fraction: None,
            input_payload: Vec::new(),
            image: None,
            bypass_validation: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn with_cpu_fraction(mut self, fraction: f64) -> Self {
        self.cpu_fraction = Some(fraction);
        self
    }

    pub fn with_input(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.input_payload = payload.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Ask to skip static validation (controlled test paths only)
    pub fn bypassing_validation(mut self) -> Self {
        self.bypass_validation = true;
        self
    }
}

/// Terminal classification of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Guest exited with status zero
    Success,
    /// Static validation refused the source; no container was created
    ValidationRejected,
    /// Deadline exceeded; the container was killed
    Timeout,
    /// The engine's caps killed the guest or the monitor saw a limit crossed
    ResourceViolation,
    /// Guest exited non-zero or was killed by a signal
    RuntimeError,
    /// Sandbox infrastructure failed
    InternalError,
    /// The caller cancelled the request
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::ValidationRejected => "validation_rejected",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::ResourceViolation => "resource_violation",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::InternalError => "internal_error",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one finished request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: RequestId,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Guest run time; zero when nothing ran
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub resource_usage: ResourceSnapshot,
    /// Absent only when validation was bypassed
    pub validation_report: Option<ValidationReport>,
    pub output_truncated: bool,
    /// Engine id of the container, when one was created
    pub container_id: Option<String>,
    /// States passed through, in order
    pub states: Vec<ExecutionState>,
    /// Infrastructure or cancellation detail
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub(crate) fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            status: ExecutionStatus::InternalError,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration: Duration::ZERO,
            resource_usage: ResourceSnapshot::default(),
            validation_report: None,
            output_truncated: false,
            container_id: None,
            states: Vec::new(),
            error: None,
            started_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Whether a container was created for this request
    pub fn launched(&self) -> bool {
        self.states.contains(&ExecutionState::Launching) && self.container_id.is_some()
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        match self.status {
            ExecutionStatus::ValidationRejected => match &self.validation_report {
                Some(report) => format!("rejected: {}", report.summary()),
                None => "rejected".to_string(),
            },
            ExecutionStatus::Success | ExecutionStatus::RuntimeError => format!(
                "{} (exit {}, {:.2}s)",
                self.status,
                self.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                self.duration.as_secs_f64()
            ),
            _ => match &self.error {
                Some(error) => format!("{}: {}", self.status, error),
                None => format!("{} ({:.2}s)", self.status, self.duration.as_secs_f64()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = ExecutionRequest::new("print(1)\n")
            .with_id("req-1")
            .with_time_limit(Duration::from_secs(2))
            .with_memory_limit(64 * 1024 * 1024)
            .with_cpu_fraction(0.5)
            .with_input(b"{}".to_vec());
        assert_eq!(request.id.as_str(), "req-1");
        assert_eq!(request.time_limit, Some(Duration::from_secs(2)));
        assert_eq!(request.input_payload, b"{}");
        assert!(!request.bypass_validation);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: ExecutionRequest =
            serde_json::from_str(r#"{"source_code": "print(1)", "time_limit": "3s"}"#).unwrap();
        assert_eq!(request.time_limit, Some(Duration::from_secs(3)));
        assert!(request.memory_limit_bytes.is_none());
        assert!(!request.id.as_str().is_empty());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionStatus::ValidationRejected).unwrap();
        assert_eq!(json, "\"validation_rejected\"");
        assert_eq!(ExecutionStatus::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_summary_mentions_exit_code() {
        let mut result = ExecutionResult::new(RequestId::new("r"));
        result.status = ExecutionStatus::RuntimeError;
        result.exit_code = Some(3);
        assert!(result.summary().contains("exit 3"));

        result.status = ExecutionStatus::InternalError;
        result.error = Some("engine unavailable".into());
        assert_eq!(result.summary(), "internal_error: engine unavailable");
    }
}
