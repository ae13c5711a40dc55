//! Owns one execution from admission to its single terminal result.
//!
//! While `Running`, the only blocking wait is a three-way `select!` over the
//! exit watcher, the governor and the cancellation channel. Reaping always
//! disarms the governor first, sweeps the group with SIGKILL, and only then
//! reaps the leader, so no signal can reach a recycled pgid.

use crate::config::builder::IsolationConfigBuilder;
use crate::config::server::ServerConfig;
use crate::config::types::{ExecutionId, ExecutionRequest, IsolationConfig, Result};
use crate::core::types::{
    CapturedOutput, ExecutionOutcome, ExecutionResult, LaunchFailure, LaunchFailureKind,
    Lifecycle, SupervisorState, UsageStats,
};
use crate::engine::IsolationEngine;
use crate::exec::governor::{FireCause, FireEvent, KillReport, TimeoutGovernor};
use crate::exec::launcher::{ExecutionHandle, ProcessLauncher};
use crate::kernel::process::{self, ExitObservation};
use crate::observability::audit::{self, AuditEvent, AuditEventType};
use crate::observability::metrics::SupervisorMetrics;
use crate::runtime::RuntimeRegistry;
use crate::utils::output::OutputCollector;
use crate::verdict::classify::{EvidenceBundle, VerdictClassifier};
use crossbeam_channel::{never, select, Receiver};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Extra time allowed for the leader to die after SIGKILL was due
const EXIT_AFTER_KILL_SLACK: Duration = Duration::from_secs(5);

/// What the `Running` wait ended on
struct RunningEvidence {
    exit: Option<ExitObservation>,
    fired: Option<FireEvent>,
    watch_error: Option<String>,
}

pub struct Supervisor {
    server: Arc<ServerConfig>,
    runtimes: Arc<RuntimeRegistry>,
    launcher: ProcessLauncher,
    metrics: Arc<SupervisorMetrics>,
}

impl Supervisor {
    pub fn new(
        server: Arc<ServerConfig>,
        runtimes: Arc<RuntimeRegistry>,
        engine: Arc<dyn IsolationEngine>,
        metrics: Arc<SupervisorMetrics>,
    ) -> Self {
        Self {
            server,
            runtimes,
            launcher: ProcessLauncher::new(engine),
            metrics,
        }
    }

    pub fn metrics(&self) -> &SupervisorMetrics {
        &self.metrics
    }

    /// Run one admitted execution to completion. Always returns exactly one result.
    pub fn run(
        &self,
        execution_id: ExecutionId,
        request: &ExecutionRequest,
        cancel: Receiver<()>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let mut lifecycle = Lifecycle::new(execution_id.clone());
        lifecycle.advance(SupervisorState::Configuring);

        AuditEvent::new(AuditEventType::ExecutionStart, &execution_id, "execution admitted")
            .with_runtime(&request.runtime)
            .emit();

        let (outcome, output, usage) = self.configure_and_run(&mut lifecycle, &execution_id, request, &cancel);

        let result = ExecutionResult {
            execution_id,
            output,
            outcome,
            duration: started.elapsed(),
            usage,
        };
        self.finish(&mut lifecycle, &result);
        result
    }

    fn configure_and_run(
        &self,
        lifecycle: &mut Lifecycle,
        execution_id: &ExecutionId,
        request: &ExecutionRequest,
        cancel: &Receiver<()>,
    ) -> (ExecutionOutcome, CapturedOutput, UsageStats) {
        let empty = || (CapturedOutput::default(), UsageStats::default());

        if cancel.try_recv().is_ok() {
            let (output, usage) = empty();
            return (ExecutionOutcome::Cancelled, output, usage);
        }

        let builder = IsolationConfigBuilder::new(&self.server, &self.runtimes);
        let config = match builder.build(execution_id, request) {
            Ok(config) => config,
            Err(e) => {
                let (output, usage) = empty();
                let reason = LaunchFailure::new(LaunchFailureKind::InvalidConfiguration, e.to_string());
                return (self.launch_failed(execution_id, reason), output, usage);
            }
        };

        lifecycle.advance(SupervisorState::Launching);
        if cancel.try_recv().is_ok() {
            log::info!("[{}] cancelled before launch", execution_id);
            let (output, usage) = empty();
            return (ExecutionOutcome::Cancelled, output, usage);
        }

        let stdin = request.stdin.as_deref().map(str::as_bytes);
        let handle = match self.launcher.launch(&config, &request.source, stdin) {
            Ok(handle) => handle,
            Err(reason) => {
                let (output, usage) = empty();
                return (self.launch_failed(execution_id, reason), output, usage);
            }
        };

        lifecycle.advance(SupervisorState::Running);
        self.supervise(lifecycle, &config, handle, cancel)
    }

    fn launch_failed(&self, execution_id: &ExecutionId, reason: LaunchFailure) -> ExecutionOutcome {
        log::warn!("[{}] launch failed: {}", execution_id, reason);
        audit::emit(
            AuditEventType::LaunchFailed,
            execution_id,
            format!("{:?}", reason.kind),
        );
        ExecutionOutcome::LaunchFailed { reason }
    }

    /// Running and Reaping for a launched process
    fn supervise(
        &self,
        lifecycle: &mut Lifecycle,
        config: &IsolationConfig,
        mut handle: ExecutionHandle,
        cancel: &Receiver<()>,
    ) -> (ExecutionOutcome, CapturedOutput, UsageStats) {
        let id = config.execution_id.clone();

        let collector = match handle.take_output() {
            Some((stdout, stderr)) => {
                OutputCollector::start(stdout, stderr, config.limits.output_bytes)
                    .map_err(|e| format!("output collector: {}", e))
            }
            None => Err("output pipes missing".to_string()),
        };
        let exit_rx = process::watch_exit(handle.pid()).map_err(|e| format!("exit watcher: {}", e));
        let armed = TimeoutGovernor::arm(
            handle.group(),
            handle.started_at() + config.limits.wall_time,
            config.kill_grace,
        )
        .map_err(|e| format!("governor: {}", e));

        let (collector, exit_rx, (token, fired_rx)) = match (collector, exit_rx, armed) {
            (Ok(c), Ok(e), Ok(a)) => (c, e, a),
            (collector, exit_rx, armed) => {
                // Disarm before the leader is reaped
                drop(armed);
                drop(exit_rx);
                let reason = "failed to start supervision threads".to_string();
                log::error!("[{}] {}", id, reason);
                lifecycle.advance(SupervisorState::Reaping);
                let output = self.abort_running(&mut handle, collector.ok(), config);
                return (
                    ExecutionOutcome::InternalError { reason },
                    output,
                    UsageStats::default(),
                );
            }
        };

        let mut evidence = wait_running(&id, &exit_rx, &fired_rx, cancel, || token.trigger());

        lifecycle.advance(SupervisorState::Reaping);

        // A fired governor lets the grace period run before the leader is expected to be gone
        if evidence.fired.is_some() && evidence.exit.is_none() && evidence.watch_error.is_none() {
            match exit_rx.recv_timeout(config.kill_grace + EXIT_AFTER_KILL_SLACK) {
                Ok(Ok(observation)) => evidence.exit = Some(observation),
                Ok(Err(e)) => evidence.watch_error = Some(e.to_string()),
                Err(_) => log::warn!("[{}] leader still alive after SIGKILL was due", id),
            }
        }

        let kill_report = token.disarm();
        if evidence.fired.is_none() {
            // Fired in the same instant the exit was observed
            evidence.fired = kill_report.fired;
        }

        if let Err(e) = handle.group().signal(Signal::SIGKILL) {
            log::warn!("[{}] group sweep failed: {}", id, e);
        }

        let reaped = handle.reap();
        let output = collector.finish(Instant::now() + config.output_drain);

        let (outcome, usage) = match (reaped, evidence.watch_error) {
            (Err(e), _) => {
                log::error!("[{}] reap failed: {}", id, e);
                (
                    ExecutionOutcome::InternalError {
                        reason: e.to_string(),
                    },
                    UsageStats::default(),
                )
            }
            (Ok(status), watch_error) => {
                let report =
                    self.launcher
                        .engine()
                        .interpret(config, &handle.report_path(), &status);
                log::debug!(
                    "[{}] reaped: {} (engine says {}, cpu {}ms, rss {} bytes)",
                    id,
                    status.exit,
                    report.exit,
                    report.usage.cpu_time_ms,
                    report.usage.peak_memory_bytes
                );
                let outcome = match watch_error {
                    Some(reason) => {
                        log::error!("[{}] exit watcher failed: {}", id, reason);
                        ExecutionOutcome::InternalError { reason }
                    }
                    None => VerdictClassifier::classify(
                        &EvidenceBundle {
                            fired: evidence.fired,
                            exit_observed_at: evidence.exit.map(|e| e.observed_at),
                            report: &report,
                            output: &output,
                        },
                    ),
                };
                (outcome, report.usage)
            }
        };

        self.audit_termination(&id, &kill_report, &outcome);
        self.cleanup(&id, &mut handle);
        (outcome, output, usage)
    }

    /// Kill, reap and drain after a supervision failure
    fn abort_running(
        &self,
        handle: &mut ExecutionHandle,
        collector: Option<OutputCollector>,
        config: &IsolationConfig,
    ) -> CapturedOutput {
        let id = handle.execution_id().clone();
        if let Err(e) = handle.group().signal(Signal::SIGKILL) {
            log::warn!("[{}] group kill failed: {}", id, e);
        }
        if let Err(e) = handle.reap() {
            log::error!("[{}] reap failed: {}", id, e);
        }
        let output = collector
            .map(|c| c.finish(Instant::now() + config.output_drain))
            .unwrap_or_default();
        self.cleanup(&id, handle);
        output
    }

    fn cleanup(&self, id: &ExecutionId, handle: &mut ExecutionHandle) {
        if let Err(e) = handle.cleanup() {
            log::warn!("[{}] cleanup failed: {}", id, e);
            self.metrics.cleanup_failures.inc();
            audit::emit(AuditEventType::CleanupFailure, id, e.to_string());
        }
    }

    fn audit_termination(&self, id: &ExecutionId, kill: &KillReport, outcome: &ExecutionOutcome) {
        if let Some(fire) = kill.fired {
            if fire.cause == FireCause::Deadline && *outcome == ExecutionOutcome::TimedOut {
                audit::emit(AuditEventType::WallTimeLimitViolation, id, "wall-clock deadline reached");
            }
        }
        if kill.term_sent {
            audit::emit(AuditEventType::GracefulKill, id, "SIGTERM sent to process group");
        }
        if kill.kill_sent {
            audit::emit(AuditEventType::ForcedKill, id, "SIGKILL sent after grace period");
        }
        match outcome {
            ExecutionOutcome::OutputLimitExceeded => {
                audit::emit(AuditEventType::OutputLimitViolation, id, "output cap reached")
            }
            ExecutionOutcome::ResourceLimitExceeded { which } => audit::emit(
                AuditEventType::ResourceLimitViolation,
                id,
                format!("{} limit enforced", which),
            ),
            ExecutionOutcome::Cancelled => {
                audit::emit(AuditEventType::Cancelled, id, "cancelled while running")
            }
            ExecutionOutcome::LaunchFailed { reason } => audit::emit(
                AuditEventType::LaunchFailed,
                id,
                format!("engine setup failed: {:?}", reason.kind),
            ),
            _ => {}
        }
    }

    fn finish(&self, lifecycle: &mut Lifecycle, result: &ExecutionResult) {
        lifecycle.advance(result.outcome.terminal_state());
        self.metrics.record_outcome(&result.outcome, result.duration);

        log::info!(
            "[{}] {} in {}ms (stdout {}B{}, stderr {}B{})",
            result.execution_id,
            result.outcome.label(),
            result.duration.as_millis(),
            result.output.stdout.len(),
            if result.output.stdout_truncated { ", truncated" } else { "" },
            result.output.stderr.len(),
            if result.output.stderr_truncated { ", truncated" } else { "" },
        );
        AuditEvent::new(
            AuditEventType::ExecutionEnd,
            &result.execution_id,
            format!("finished in {}ms", result.duration.as_millis()),
        )
        .with_outcome(result.outcome.label())
        .emit();
    }
}

/// The `Running` wait: first of exit, governor fire, or cancellation.
/// Cancellation only triggers the governor; the loop then waits for its fire.
fn wait_running(
    id: &ExecutionId,
    exit_rx: &Receiver<Result<ExitObservation>>,
    fired_rx: &Receiver<FireEvent>,
    cancel: &Receiver<()>,
    trigger: impl Fn(),
) -> RunningEvidence {
    let never_cancel = never();
    let never_fired = never();
    let mut cancel_open = true;
    let mut fired_open = true;

    loop {
        let cancel_rx = if cancel_open { cancel } else { &never_cancel };
        let fired_src = if fired_open { fired_rx } else { &never_fired };

        select! {
            recv(exit_rx) -> msg => {
                return match msg {
                    Ok(Ok(observation)) => RunningEvidence {
                        exit: Some(observation),
                        fired: None,
                        watch_error: None,
                    },
                    Ok(Err(e)) => RunningEvidence {
                        exit: None,
                        fired: None,
                        watch_error: Some(e.to_string()),
                    },
                    Err(_) => RunningEvidence {
                        exit: None,
                        fired: None,
                        watch_error: Some("exit watcher disconnected".to_string()),
                    },
                };
            }
            recv(fired_src) -> msg => match msg {
                Ok(event) => {
                    return RunningEvidence {
                        exit: None,
                        fired: Some(event),
                        watch_error: None,
                    };
                }
                Err(_) => fired_open = false,
            },
            recv(cancel_rx) -> msg => {
                if msg.is_ok() {
                    log::info!("[{}] cancellation requested", id);
                    trigger();
                }
                cancel_open = false;
            }
        }
    }
}
