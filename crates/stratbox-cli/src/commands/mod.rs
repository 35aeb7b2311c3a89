//! Subcommand implementations

pub mod batch;
pub mod doctor;
pub mod run;
pub mod validate;

use anyhow::Context;
use std::path::Path;
use std::process::ExitCode;
use stratbox_core::{SandboxConfig, SandboxOrchestrator};

/// How a command finished, mapped onto the process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Everything was safe or succeeded
    Passed,
    /// At least one strategy was rejected or did not succeed
    Failed,
    /// The sandbox itself could not do its job
    Broken,
}

impl Verdict {
    pub fn from_all(passed: bool) -> Self {
        if passed { Verdict::Passed } else { Verdict::Failed }
    }
}

impl From<Verdict> for ExitCode {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Passed => ExitCode::SUCCESS,
            Verdict::Failed => ExitCode::from(1),
            Verdict::Broken => ExitCode::from(2),
        }
    }
}

pub(crate) fn read_source(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read strategy file '{}'", path.display()))
}

pub(crate) fn docker_orchestrator(config: SandboxConfig) -> anyhow::Result<SandboxOrchestrator> {
    SandboxOrchestrator::docker(config).context("Invalid sandbox configuration")
}

/// Display label for a file argument
pub(crate) fn label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
