/// Outcome classification
/// A pure function over the evidence gathered while reaping; no I/O.
use crate::core::types::{CapturedOutput, ExecutionOutcome, LaunchFailure, LaunchFailureKind};
use crate::engine::EngineReport;
use crate::exec::governor::{FireCause, FireEvent};
use crate::kernel::process::ExitEvidence;
use std::time::Instant;

/// Everything known about one execution once its leader is reaped
#[derive(Debug)]
pub struct EvidenceBundle<'a> {
    /// Governor fire, if it fired at all
    pub fired: Option<FireEvent>,
    /// When the exit watcher saw the leader exit
    pub exit_observed_at: Option<Instant>,
    pub report: &'a EngineReport,
    pub output: &'a CapturedOutput,
}

impl EvidenceBundle<'_> {
    /// Governor fire that happened before the exit was observed. An equal
    /// instant counts as a natural exit; an exit observed after the fire
    /// (even one that raced it) is a timeout.
    fn effective_fire(&self) -> Option<FireEvent> {
        let fired = self.fired?;
        match self.exit_observed_at {
            Some(exited) if exited <= fired.at => None,
            _ => Some(fired),
        }
    }
}

pub struct VerdictClassifier;

impl VerdictClassifier {
    /// Classify execution outcome. Deterministic; the first matching rule wins.
    pub fn classify(evidence: &EvidenceBundle) -> ExecutionOutcome {
        if let Some(fire) = evidence.effective_fire() {
            return match fire.cause {
                FireCause::Cancelled => ExecutionOutcome::Cancelled,
                FireCause::Deadline => match evidence.output.first_cap_hit() {
                    // Blocked on a full pipe after the cap: the cap is the cause
                    Some(capped) if capped <= fire.at => ExecutionOutcome::OutputLimitExceeded,
                    _ => ExecutionOutcome::TimedOut,
                },
            };
        }

        let report = evidence.report;
        if let Some(detail) = &report.setup_failure {
            return ExecutionOutcome::LaunchFailed {
                reason: LaunchFailure::new(LaunchFailureKind::EngineSetupFailed, detail.clone()),
            };
        }

        if let Some(which) = report.violation {
            return ExecutionOutcome::ResourceLimitExceeded { which };
        }

        if report.engine_timed_out {
            return ExecutionOutcome::TimedOut;
        }

        match report.exit {
            ExitEvidence::Signaled(signal) => ExecutionOutcome::Signaled { signal },
            ExitEvidence::Exited(_) if evidence.output.any_truncated() => {
                ExecutionOutcome::OutputLimitExceeded
            }
            ExitEvidence::Exited(exit_code) => ExecutionOutcome::Completed { exit_code },
        }
    }
}
