//! Incremental aggregation of samples

use super::types::{LimitBreach, MonitorLimits, ResourceSample, ResourceSnapshot};
use crate::runtime::ResourceStats;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Folds samples into peaks, running means and a bounded history
#[derive(Debug)]
pub(crate) struct Accumulator {
    limits: MonitorLimits,
    history: VecDeque<ResourceSample>,
    capacity: usize,
    max_breaches: usize,
    breaches: Vec<LimitBreach>,
    violated: bool,
    count: u64,
    failed: u64,
    cpu_peak: f64,
    cpu_mean: f64,
    memory_peak: u64,
    memory_mean: f64,
    pids_peak: u32,
    io_total: u64,
    last_io: Option<u64>,
}

impl Accumulator {
    pub(crate) fn new(limits: MonitorLimits, capacity: usize, max_breaches: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            limits,
            history: VecDeque::with_capacity(capacity),
            capacity,
            max_breaches,
            breaches: Vec::new(),
            violated: false,
            count: 0,
            failed: 0,
            cpu_peak: 0.0,
            cpu_mean: 0.0,
            memory_peak: 0,
            memory_mean: 0.0,
            pids_peak: 0,
            io_total: 0,
            last_io: None,
        }
    }

    /// Record one sample, returning the breach it caused
    pub(crate) fn record(
        &mut self,
        stats: ResourceStats,
        timestamp: DateTime<Utc>,
    ) -> Option<LimitBreach> {
        self.count += 1;
        let n = self.count as f64;
        self.cpu_peak = self.cpu_peak.max(stats.cpu_percent);
        self.cpu_mean += (stats.cpu_percent - self.cpu_mean) / n;
        self.memory_peak = self.memory_peak.max(stats.memory_bytes);
        self.memory_mean += (stats.memory_bytes as f64 - self.memory_mean) / n;
        self.pids_peak = self.pids_peak.max(stats.pids);

        // Counter resets (container restarted) count from zero.
        let io_ops_delta = match (stats.io_ops, self.last_io) {
            (Some(now), Some(prev)) if now >= prev => now - prev,
            (Some(now), _) => now,
            (None, _) => 0,
        };
        if stats.io_ops.is_some() {
            self.last_io = stats.io_ops;
        }
        self.io_total = self.io_total.saturating_add(io_ops_delta);

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(ResourceSample {
            cpu_percent: stats.cpu_percent,
            memory_bytes: stats.memory_bytes,
            pids: stats.pids,
            io_ops_delta,
            timestamp,
        });

        let (kind, observed, limit) = self.limits.check(&stats)?;
        self.violated = true;
        let breach = LimitBreach {
            kind,
            observed,
            limit,
            timestamp,
        };
        // The first breach explains the verdict and is never dropped
        if self.breaches.len() < self.max_breaches.max(1) {
            self.breaches.push(breach.clone());
        }
        Some(breach)
    }

    pub(crate) fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed
    }

    pub(crate) fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent_peak: self.cpu_peak,
            cpu_percent_avg: self.cpu_mean,
            memory_bytes_peak: self.memory_peak,
            memory_bytes_avg: self.memory_mean.round() as u64,
            pids_peak: self.pids_peak,
            io_ops_count: self.io_total,
            recent_samples: self.history.iter().cloned().collect(),
            sample_count: self.count,
            failed_samples: self.failed,
            breaches: self.breaches.clone(),
            violated: self.violated,
        }
    }
}
