//! Orchestrator counters

use crate::types::{ExecutionResult, ExecutionStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time copy of the orchestrator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub total: u64,
    pub succeeded: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub resource_violated: u64,
    pub runtime_errors: u64,
    pub internal_errors: u64,
    pub cancelled: u64,
    /// Containers alive right now
    pub active_containers: usize,
    /// Most containers alive at once
    pub peak_active_containers: usize,
    /// Containers whose removal failed
    pub cleanup_failures: u64,
}

/// Outcome counts for one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub rejected: usize,
    pub timed_out: usize,
    pub resource_violated: usize,
    pub runtime_errors: usize,
    pub internal_errors: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn from_results(results: &[ExecutionResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match result.status {
                ExecutionStatus::Success => summary.succeeded += 1,
                ExecutionStatus::ValidationRejected => summary.rejected += 1,
                ExecutionStatus::Timeout => summary.timed_out += 1,
                ExecutionStatus::ResourceViolation => summary.resource_violated += 1,
                ExecutionStatus::RuntimeError => summary.runtime_errors += 1,
                ExecutionStatus::InternalError => summary.internal_errors += 1,
                ExecutionStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    total: AtomicU64,
    succeeded: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    resource_violated: AtomicU64,
    runtime_errors: AtomicU64,
    internal_errors: AtomicU64,
    cancelled: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    cleanup_failures: AtomicU64,
}

impl Counters {
    pub(crate) fn request_received(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, status: ExecutionStatus) {
        let counter = match status {
            ExecutionStatus::Success => &self.succeeded,
            ExecutionStatus::ValidationRejected => &self.rejected,
            ExecutionStatus::Timeout => &self.timed_out,
            ExecutionStatus::ResourceViolation => &self.resource_violated,
            ExecutionStatus::RuntimeError => &self.runtime_errors,
            ExecutionStatus::InternalError => &self.internal_errors,
            ExecutionStatus::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cleanup_failed(&self) {
        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> OrchestratorStats {
        OrchestratorStats {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            resource_violated: self.resource_violated.load(Ordering::Relaxed),
            runtime_errors: self.runtime_errors.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            active_containers: self.active.load(Ordering::Acquire),
            peak_active_containers: self.peak_active.load(Ordering::Acquire),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
        }
    }
}

/// Counts one live container for as long as it is held
pub(crate) struct ActiveContainer {
    counters: Arc<Counters>,
}

impl ActiveContainer {
    pub(crate) fn enter(counters: &Arc<Counters>) -> Self {
        let now = counters.active.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak_active.fetch_max(now, Ordering::AcqRel);
        Self {
            counters: Arc::clone(counters),
        }
    }
}

impl Drop for ActiveContainer {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::AcqRel);
    }
}
