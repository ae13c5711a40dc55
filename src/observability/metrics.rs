// In-process counters for admissions and outcomes.
//
// Invariant: every admitted execution increments exactly one outcome counter.

use crate::core::types::ExecutionOutcome;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct SupervisorMetrics {
    pub admitted: Counter,
    pub rejected_at_capacity: Counter,
    pub rejected_config: Counter,
    pub running: Gauge,

    pub completed: Counter,
    pub timed_out: Counter,
    pub signaled: Counter,
    pub output_limit_exceeded: Counter,
    pub resource_limit_exceeded: Counter,
    pub launch_failed: Counter,
    pub cancelled: Counter,
    pub internal_error: Counter,

    pub cleanup_failures: Counter,
    total_duration_ms: Counter,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub rejected_at_capacity: u64,
    pub rejected_config: u64,
    pub running: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub signaled: u64,
    pub output_limit_exceeded: u64,
    pub resource_limit_exceeded: u64,
    pub launch_failed: u64,
    pub cancelled: u64,
    pub internal_error: u64,
    pub cleanup_failures: u64,
    pub total_duration_ms: u64,
}

impl SupervisorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outcome(&self, outcome: &ExecutionOutcome, duration: Duration) {
        let counter = match outcome {
            ExecutionOutcome::Completed { .. } => &self.completed,
            ExecutionOutcome::TimedOut => &self.timed_out,
            ExecutionOutcome::Signaled { .. } => &self.signaled,
            ExecutionOutcome::OutputLimitExceeded => &self.output_limit_exceeded,
            ExecutionOutcome::ResourceLimitExceeded { .. } => &self.resource_limit_exceeded,
            ExecutionOutcome::LaunchFailed { .. } => &self.launch_failed,
            ExecutionOutcome::Cancelled => &self.cancelled,
            ExecutionOutcome::InternalError { .. } => &self.internal_error,
        };
        counter.inc();
        self.total_duration_ms.add(duration.as_millis() as u64);
    }

    /// Number of executions that reached a terminal outcome
    pub fn finished(&self) -> u64 {
        [
            &self.completed,
            &self.timed_out,
            &self.signaled,
            &self.output_limit_exceeded,
            &self.resource_limit_exceeded,
            &self.launch_failed,
            &self.cancelled,
            &self.internal_error,
        ]
        .iter()
        .map(|c| c.get())
        .sum()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.get(),
            rejected_at_capacity: self.rejected_at_capacity.get(),
            rejected_config: self.rejected_config.get(),
            running: self.running.get(),
            completed: self.completed.get(),
            timed_out: self.timed_out.get(),
            signaled: self.signaled.get(),
            output_limit_exceeded: self.output_limit_exceeded.get(),
            resource_limit_exceeded: self.resource_limit_exceeded.get(),
            launch_failed: self.launch_failed.get(),
            cancelled: self.cancelled.get(),
            internal_error: self.internal_error.get(),
            cleanup_failures: self.cleanup_failures.get(),
            total_duration_ms: self.total_duration_ms.get(),
        }
    }
}
