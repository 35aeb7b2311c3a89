//! Sandbox configuration
//!
//! Loaded from TOML, YAML or JSON (chosen by file extension), then overlaid
//! with `STRATBOX_*` environment variables. Every section defaults, so a
//! partial file only has to name what it changes.

use crate::error::{SandboxError, SandboxResult};
use crate::validation::ValidationPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Smallest memory cap container engines accept
pub const MIN_MEMORY_BYTES: u64 = 6 * MIB;

/// Complete sandbox configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Static validation policy
    pub validation: ValidationPolicy,
    /// Container engine and limits
    pub runtime: RuntimeConfig,
    /// Resource sampling
    pub monitor: MonitorConfig,
    /// Request scheduling
    pub orchestrator: OrchestratorConfig,
}

/// Container engine, image and resource ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Engine CLI binary (`docker`, `podman`)
    pub engine_binary: String,
    /// Image the guest runs in
    pub image: String,
    /// Interpreter command; the script path is appended
    pub interpreter: Vec<String>,
    /// Pull the image when it is missing locally
    pub pull_missing_image: bool,
    /// Mount point of the writable scratch tmpfs
    pub scratch_dir: String,
    /// Size of the scratch tmpfs
    pub scratch_bytes: u64,
    /// Unprivileged `uid:gid` the guest runs as
    pub user: String,
    /// Memory cap used when a request does not ask for one
    pub default_memory_bytes: u64,
    /// Largest memory cap a request may ask for
    pub max_memory_bytes: u64,
    /// CPU share used when a request does not ask for one
    pub default_cpu_fraction: f64,
    /// Largest CPU share a request may ask for
    pub max_cpu_fraction: f64,
    /// Process and thread cap
    pub max_processes: u32,
    /// Open file descriptor cap
    pub max_open_files: u32,
    /// Time limit used when a request does not ask for one
    #[serde(with = "humantime_serde")]
    pub default_time_limit: Duration,
    /// Largest time limit a request may ask for
    #[serde(with = "humantime_serde")]
    pub max_time_limit: Duration,
    /// How long a forced kill may take before the client is abandoned
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,
    /// Deadline for individual engine commands (create, stats, remove)
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Captured bytes per output stream
    pub max_output_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine_binary: "docker".to_string(),
            image: "python:3.12-slim".to_string(),
            interpreter: vec!["python3".to_string(), "-I".to_string(), "-B".to_string()],
            pull_missing_image: false,
            scratch_dir: "/scratch".to_string(),
            scratch_bytes: 16 * MIB,
            user: "65534:65534".to_string(),
            default_memory_bytes: 256 * MIB,
            max_memory_bytes: 1024 * MIB,
            default_cpu_fraction: 1.0,
            max_cpu_fraction: 2.0,
            max_processes: 64,
            max_open_files: 256,
            default_time_limit: Duration::from_secs(10),
            max_time_limit: Duration::from_secs(300),
            kill_grace: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024, // 1 MB
        }
    }
}

/// Resource sampling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between samples
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Samples kept in the ring buffer
    pub history_capacity: usize,
    /// Limit breaches kept for the report; the first is kept even at zero
    pub max_breaches: usize,
    /// Fraction of the container memory cap that counts as a violation
    pub memory_violation_ratio: f64,
    /// CPU percentage that counts as a violation; unlimited when unset
    pub max_cpu_percent: Option<f64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(500),
            history_capacity: 120,
            max_breaches: 32,
            memory_violation_ratio: 0.95,
            max_cpu_percent: None,
        }
    }
}

/// Request scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Containers alive at the same time
    pub max_concurrent_containers: usize,
    /// Kill the container as soon as the monitor reports a violation
    pub kill_on_violation: bool,
    /// Honour `bypass_validation` on requests (controlled test paths only)
    pub allow_validation_bypass: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_containers: 4,
            kill_on_violation: true,
            allow_validation_bypass: false,
        }
    }
}

impl SandboxConfig {
    /// Strict preset: warnings block, lower threshold, tighter limits
    pub fn strict() -> Self {
        Self {
            validation: ValidationPolicy::strict(),
            runtime: RuntimeConfig {
                scratch_bytes: 8 * MIB,
                default_memory_bytes: 128 * MIB,
                max_memory_bytes: 512 * MIB,
                max_cpu_fraction: 1.0,
                max_processes: 32,
                max_open_files: 64,
                default_time_limit: Duration::from_secs(5),
                max_time_limit: Duration::from_secs(60),
                max_output_bytes: 256 * 1024,
                ..RuntimeConfig::default()
            },
            monitor: MonitorConfig {
                memory_violation_ratio: 0.9,
                ..MonitorConfig::default()
            },
            orchestrator: OrchestratorConfig::default(),
        }
    }

    /// Load configuration from a file
    ///
    /// Supports JSON, TOML, and YAML formats based on file extension.
    /// Returns the default configuration if the file doesn't exist.
    pub fn from_file(path: impl AsRef<Path>) -> SandboxResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::config(format!("failed to read '{}': {}", path.display(), e))
        })?;

        let config = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|e| {
                SandboxError::config(format!("invalid TOML in '{}': {}", path.display(), e))
            })?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| {
                SandboxError::config(format!("invalid YAML in '{}': {}", path.display(), e))
            })?,
            _ => serde_json::from_str(&content).map_err(|e| {
                SandboxError::config(format!("invalid JSON in '{}': {}", path.display(), e))
            })?,
        };
        Ok(config)
    }

    /// Load from an optional file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> SandboxResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `STRATBOX_*` environment variables
    pub fn apply_env_overrides(&mut self) -> SandboxResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay overrides read through `lookup`
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> SandboxResult<()> {
        if let Some(image) = lookup("STRATBOX_IMAGE") {
            self.runtime.image = image;
        }
        if let Some(binary) = lookup("STRATBOX_ENGINE") {
            self.runtime.engine_binary = binary;
        }
        if let Some(value) = lookup("STRATBOX_MAX_CONCURRENCY") {
            self.orchestrator.max_concurrent_containers = value
                .trim()
                .parse()
                .map_err(|_| SandboxError::config("Invalid STRATBOX_MAX_CONCURRENCY value"))?;
        }
        if let Some(value) = lookup("STRATBOX_STRICT_MODE") {
            self.validation.strict_mode = parse_flag(&value)
                .ok_or_else(|| SandboxError::config("Invalid STRATBOX_STRICT_MODE value"))?;
        }
        if let Some(value) = lookup("STRATBOX_RISK_THRESHOLD") {
            self.validation.risk_threshold = value
                .trim()
                .parse()
                .map_err(|_| SandboxError::config("Invalid STRATBOX_RISK_THRESHOLD value"))?;
        }
        if let Some(value) = lookup("STRATBOX_SAMPLE_INTERVAL") {
            self.monitor.sample_interval =
                humantime_serde::re::humantime::parse_duration(value.trim())
                    .map_err(|_| SandboxError::config("Invalid STRATBOX_SAMPLE_INTERVAL value"))?;
        }
        Ok(())
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> SandboxResult<()> {
        self.validation.validate().map_err(SandboxError::config)?;

        let rt = &self.runtime;
        if rt.engine_binary.trim().is_empty() {
            return Err(SandboxError::config("engine_binary must not be empty"));
        }
        if rt.image.trim().is_empty() || rt.image.starts_with('-') {
            return Err(SandboxError::config(format!("invalid image '{}'", rt.image)));
        }
        if rt.interpreter.is_empty() {
            return Err(SandboxError::config("interpreter must name a command"));
        }
        if !rt.scratch_dir.starts_with('/') {
            return Err(SandboxError::config("scratch_dir must be an absolute path"));
        }
        if rt.scratch_bytes < MIB {
            return Err(SandboxError::config("scratch_bytes must be at least 1 MiB"));
        }
        if rt.default_memory_bytes < MIN_MEMORY_BYTES {
            return Err(SandboxError::config(format!(
                "default_memory_bytes must be at least {} bytes",
                MIN_MEMORY_BYTES
            )));
        }
        if rt.default_memory_bytes > rt.max_memory_bytes {
            return Err(SandboxError::config(
                "default_memory_bytes exceeds max_memory_bytes",
            ));
        }
        if !(rt.max_cpu_fraction.is_finite() && rt.max_cpu_fraction > 0.0) {
            return Err(SandboxError::config("max_cpu_fraction must be positive"));
        }
        if !(rt.default_cpu_fraction > 0.0 && rt.default_cpu_fraction <= rt.max_cpu_fraction) {
            return Err(SandboxError::config(
                "default_cpu_fraction must be within (0, max_cpu_fraction]",
            ));
        }
        if rt.max_processes == 0 || rt.max_open_files == 0 {
            return Err(SandboxError::config(
                "max_processes and max_open_files must be > 0",
            ));
        }
        if rt.default_time_limit.is_zero() || rt.default_time_limit > rt.max_time_limit {
            return Err(SandboxError::config(
                "default_time_limit must be within (0, max_time_limit]",
            ));
        }
        if rt.max_output_bytes == 0 {
            return Err(SandboxError::config("max_output_bytes must be > 0"));
        }

        let mon = &self.monitor;
        if mon.sample_interval.is_zero() {
            return Err(SandboxError::config("sample_interval must be > 0"));
        }
        if mon.history_capacity == 0 {
            return Err(SandboxError::config("history_capacity must be > 0"));
        }
        if !(mon.memory_violation_ratio > 0.0 && mon.memory_violation_ratio <= 1.0) {
            return Err(SandboxError::config(
                "memory_violation_ratio must be within (0, 1]",
            ));
        }
        if mon.max_cpu_percent.is_some_and(|p| !(p > 0.0)) {
            return Err(SandboxError::config("max_cpu_percent must be positive"));
        }

        if self.orchestrator.max_concurrent_containers == 0 {
            return Err(SandboxError::config(
                "max_concurrent_containers must be > 0",
            ));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
