//! Runtime resource monitoring
//!
//! A dedicated task per container polls the engine's accounting at a fixed
//! interval. Live snapshots and the first limit breach are published over
//! `watch` channels; [`MonitorToken::detach`] stops the task and returns the
//! final [`ResourceSnapshot`].

mod accumulator;
mod types;

pub use types::{BreachKind, LimitBreach, MonitorLimits, ResourceSample, ResourceSnapshot};

use crate::config::MonitorConfig;
use crate::runtime::{ContainerEngine, ContainerHandle, ContainerId};
use accumulator::Accumulator;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, warn};

/// Consecutive failed samples before a warning is logged
const FAILURE_WARN_THRESHOLD: u64 = 3;

/// Spawns sampling tasks against a container engine
#[derive(Clone)]
pub struct ResourceMonitor {
    engine: Arc<dyn ContainerEngine>,
    config: MonitorConfig,
}

impl ResourceMonitor {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: MonitorConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start sampling `handle` every `interval`
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(
        &self,
        handle: &ContainerHandle,
        interval: Duration,
        limits: MonitorLimits,
    ) -> MonitorToken {
        let accumulator = Accumulator::new(
            limits,
            self.config.history_capacity,
            self.config.max_breaches,
        );
        let cancel = CancellationToken::new();
        let (live_tx, live_rx) = watch::channel(ResourceSnapshot::default());
        let (breach_tx, breach_rx) = watch::channel(None);

        let task = tokio::spawn(sample_loop(
            Arc::clone(&self.engine),
            handle.id().clone(),
            interval.max(Duration::from_millis(1)),
            accumulator,
            cancel.clone(),
            live_tx,
            breach_tx,
        ));
        debug!(container = %handle.id(), interval_ms = interval.as_millis() as u64, "Monitor attached");

        MonitorToken {
            container: handle.id().clone(),
            guard: cancel.drop_guard(),
            task,
            live: live_rx,
            breach: breach_rx,
        }
    }

    /// Start sampling at the configured interval
    pub fn attach_default(&self, handle: &ContainerHandle, limits: MonitorLimits) -> MonitorToken {
        self.attach(handle, self.config.sample_interval, limits)
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .finish()
    }
}

/// A running sampling task
///
/// Dropping the token stops sampling; [`MonitorToken::detach`] also returns
/// the final summary.
#[derive(Debug)]
pub struct MonitorToken {
    container: ContainerId,
    guard: DropGuard,
    task: JoinHandle<ResourceSnapshot>,
    live: watch::Receiver<ResourceSnapshot>,
    breach: watch::Receiver<Option<LimitBreach>>,
}

impl MonitorToken {
    pub fn container(&self) -> &ContainerId {
        &self.container
    }

    /// Most recent published snapshot
    pub fn latest(&self) -> ResourceSnapshot {
        self.live.borrow().clone()
    }

    /// Receiver of live snapshots
    pub fn subscribe(&self) -> watch::Receiver<ResourceSnapshot> {
        self.live.clone()
    }

    /// Resolve with the first limit breach
    ///
    /// Never resolves if sampling ends without one, so it is safe to use as
    /// a `select!` branch.
    pub async fn violation(&mut self) -> LimitBreach {
        let breach = match self.breach.wait_for(Option::is_some).await {
            Ok(current) => current.clone(),
            Err(_) => None,
        };
        match breach {
            Some(breach) => breach,
            None => std::future::pending().await,
        }
    }

    /// Stop sampling and return the final summary
    pub async fn detach(self) -> ResourceSnapshot {
        let MonitorToken {
            container,
            guard,
            task,
            live,
            ..
        } = self;
        drop(guard);
        match task.await {
            Ok(snapshot) => {
                debug!(
                    container = %container,
                    samples = snapshot.sample_count,
                    violated = snapshot.violated,
                    "Monitor detached"
                );
                snapshot
            }
            Err(e) => {
                error!(container = %container, error = %e, "Monitor task failed");
                let last = live.borrow().clone();
                last
            }
        }
    }
}

async fn sample_loop(
    engine: Arc<dyn ContainerEngine>,
    container: ContainerId,
    interval: Duration,
    mut accumulator: Accumulator,
    cancel: CancellationToken,
    live: watch::Sender<ResourceSnapshot>,
    breach: watch::Sender<Option<LimitBreach>>,
) -> ResourceSnapshot {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = engine.stats(&container) => result,
        };

        match result {
            Ok(stats) => {
                consecutive_failures = 0;
                if let Some(found) = accumulator.record(stats, Utc::now()) {
                    if breach.borrow().is_none() {
                        warn!(container = %container, breach = %found, "Resource limit reached");
                        breach.send_replace(Some(found));
                    }
                }
            }
            Err(e) => {
                accumulator.record_failure();
                consecutive_failures += 1;
                if consecutive_failures == FAILURE_WARN_THRESHOLD {
                    warn!(container = %container, error = %e, "Resource sampling is failing");
                } else {
                    debug!(container = %container, error = %e, "Sample failed");
                }
            }
        }
        live.send_replace(accumulator.snapshot());
    }

    accumulator.snapshot()
}
