//! Monitor data types

use crate::config::MonitorConfig;
use crate::runtime::{ContainerConstraints, ResourceStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One accounting sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub pids: u32,
    /// I/O operations since the previous sample
    pub io_ops_delta: u64,
    pub timestamp: DateTime<Utc>,
}

/// Soft limits checked on every sample
///
/// The engine enforces the hard caps; these flag a container that is
/// running at or past them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorLimits {
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_percent: Option<f64>,
    pub max_processes: Option<u32>,
}

impl MonitorLimits {
    /// No limits; sampling only
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Limits derived from the caps a container was launched with
    pub fn from_constraints(constraints: &ContainerConstraints, config: &MonitorConfig) -> Self {
        let memory = (constraints.memory_bytes as f64 * config.memory_violation_ratio) as u64;
        Self {
            max_memory_bytes: Some(memory),
            max_cpu_percent: config.max_cpu_percent,
            max_processes: Some(constraints.max_processes),
        }
    }

    /// First limit `stats` crosses, if any
    pub fn check(&self, stats: &ResourceStats) -> Option<(BreachKind, f64, f64)> {
        if let Some(limit) = self.max_memory_bytes.filter(|&l| stats.memory_bytes >= l) {
            return Some((BreachKind::Memory, stats.memory_bytes as f64, limit as f64));
        }
        if let Some(limit) = self.max_processes.filter(|&l| stats.pids >= l) {
            return Some((BreachKind::Processes, stats.pids as f64, limit as f64));
        }
        if let Some(limit) = self.max_cpu_percent.filter(|&l| stats.cpu_percent > l) {
            return Some((BreachKind::Cpu, stats.cpu_percent, limit));
        }
        None
    }
}

/// Which limit was crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachKind {
    Memory,
    Cpu,
    Processes,
}

impl fmt::Display for BreachKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreachKind::Memory => write!(f, "memory"),
            BreachKind::Cpu => write!(f, "cpu"),
            BreachKind::Processes => write!(f, "processes"),
        }
    }
}

/// A sample that crossed a limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitBreach {
    pub kind: BreachKind,
    pub observed: f64,
    pub limit: f64,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} usage {:.0} reached limit {:.0}",
            self.kind, self.observed, self.limit
        )
    }
}

/// Summary of a container's resource usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent_peak: f64,
    pub cpu_percent_avg: f64,
    pub memory_bytes_peak: u64,
    pub memory_bytes_avg: u64,
    pub pids_peak: u32,
    /// Total I/O operations observed
    pub io_ops_count: u64,
    /// Most recent samples, oldest first
    pub recent_samples: Vec<ResourceSample>,
    /// Successful samples taken
    pub sample_count: u64,
    /// Samples the engine could not provide
    pub failed_samples: u64,
    /// Breaches kept for the report, oldest first
    pub breaches: Vec<LimitBreach>,
    /// Whether any sample crossed a limit
    pub violated: bool,
}

impl ResourceSnapshot {
    /// First recorded breach
    pub fn first_breach(&self) -> Option<&LimitBreach> {
        self.breaches.first()
    }
}
