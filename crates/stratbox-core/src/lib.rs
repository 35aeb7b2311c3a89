//! Stratbox Core Library
//!
//! Runs untrusted strategy source code in two passes: a static validator that
//! rejects obviously dangerous programs before any process exists, and a
//! container runtime that executes whatever passes inside a locked-down,
//! resource-capped container that is always torn down afterwards.
//!
//! The [`SandboxOrchestrator`] is the single entry point and ties the
//! [`StaticValidator`], [`ContainerRuntime`] and [`ResourceMonitor`] together.

pub mod config;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod runtime;
pub mod types;
pub mod validation;

// Re-export commonly used types
pub use config::SandboxConfig;
pub use error::{SandboxError, SandboxResult};
pub use monitor::{
    BreachKind, LimitBreach, MonitorLimits, MonitorToken, ResourceMonitor, ResourceSample,
    ResourceSnapshot,
};
pub use orchestrator::{BatchSummary, ExecutionState, OrchestratorStats, SandboxOrchestrator};
pub use runtime::{
    ContainerConstraints, ContainerEngine, ContainerHandle, ContainerRuntime, DockerEngine,
    EngineError, SubmitOutcome,
};
pub use types::{ExecutionRequest, ExecutionResult, ExecutionStatus, RequestId};
pub use validation::{
    Issue, RuleId, Severity, StaticValidator, ValidationPolicy, ValidationReport,
};
