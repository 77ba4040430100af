//! Periodic maintenance: scheduling, re-entrancy guard, and cycle reports.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::coordinator::MemoryCoordinator;

/// Maintenance cycle state. There is no error state: a failing tier is
/// logged and the cycle moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceState {
    /// No cycle in progress.
    Idle,
    /// A cycle is running.
    Running,
}

/// Result of a compression check.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CompressionReport {
    /// Weighted utilisation that was compared against the threshold.
    pub utilization_before: f64,
    /// Weighted utilisation after compression (equal to `before` when skipped).
    pub utilization_after: f64,
    /// Whether the threshold was exceeded.
    pub triggered: bool,
    /// Short-term contexts discarded.
    pub short_term_discarded: usize,
    /// Working buckets promoted to long-term and removed.
    pub buckets_archived: usize,
}

/// What one maintenance cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MaintenanceReport {
    /// Short-term contexts removed for exceeding the TTL.
    pub short_term_expired: usize,
    /// Stale working buckets archived to long-term.
    pub working_archived: usize,
    /// Long-term records purged past the retention window.
    pub long_term_purged: usize,
    /// Compression check result.
    pub compression: CompressionReport,
    /// Tier operations that failed and were skipped.
    pub failures: usize,
}

/// Outcome of requesting a maintenance cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaintenanceOutcome {
    /// Another cycle was already running; this request did nothing.
    Skipped,
    /// The cycle ran to completion.
    Completed(MaintenanceReport),
}

/// Re-entrancy guard for maintenance cycles.
#[derive(Debug, Default)]
pub(crate) struct CycleGate {
    running: AtomicBool,
}

impl CycleGate {
    /// Claims the gate, or returns `None` when a cycle is already running.
    pub(crate) fn try_enter(&self) -> Option<CyclePass<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CyclePass { gate: self })
    }

    pub(crate) fn state(&self) -> MaintenanceState {
        if self.running.load(Ordering::Acquire) {
            MaintenanceState::Running
        } else {
            MaintenanceState::Idle
        }
    }
}

/// Held while a cycle runs; releases the gate on drop.
pub(crate) struct CyclePass<'a> {
    gate: &'a CycleGate,
}

impl Drop for CyclePass<'_> {
    fn drop(&mut self) {
        self.gate.running.store(false, Ordering::Release);
    }
}

/// Handle to the background maintenance scheduler.
///
/// Dropping the handle signals shutdown without waiting; [`stop`](Self::stop)
/// also waits for an in-flight cycle to finish.
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for MaintenanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaintenanceHandle")
            .field("shutdown", &*self.shutdown.borrow())
            .field("worker", &self.worker.is_some())
            .finish()
    }
}

impl MaintenanceHandle {
    /// Returns `true` while the scheduler task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Stops the scheduler. A cycle already in progress completes first, so
    /// no tier is left partially cleaned.
    pub async fn stop(mut self) {
        self.shutdown.send_replace(true);
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                warn!(?err, "maintenance scheduler ended abnormally");
            }
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

pub(crate) fn spawn(coordinator: MemoryCoordinator, interval: Duration) -> MaintenanceHandle {
    let (shutdown, receiver) = watch::channel(false);
    let worker = tokio::spawn(run_maintenance_loop(coordinator, interval, receiver));
    MaintenanceHandle {
        shutdown,
        worker: Some(worker),
    }
}

async fn run_maintenance_loop(
    coordinator: MemoryCoordinator,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; the first cycle runs one period in.
    interval.tick().await;
    info!(?period, "maintenance scheduler started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                match coordinator.run_maintenance_cycle().await {
                    MaintenanceOutcome::Skipped => {
                        debug!("maintenance tick skipped; previous cycle still running");
                    }
                    MaintenanceOutcome::Completed(_) => {}
                }
            }
        }
    }

    info!("maintenance scheduler stopped");
}
