use crate::config::types::ExecutionId;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Supervisor lifecycle states for one execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Pending,
    Configuring,
    Launching,
    Running,
    Reaping,
    Done,
    Aborted,
}

impl SupervisorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorState::Done | SupervisorState::Aborted)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        match (self, next) {
            (Pending, Configuring) => true,
            (Configuring, Launching) => true,
            (Configuring, Done) => true,
            (Launching, Running) => true,
            (Launching, Done) => true,
            (Running, Reaping) => true,
            (Reaping, Done) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SupervisorState::Pending => "pending",
            SupervisorState::Configuring => "configuring",
            SupervisorState::Launching => "launching",
            SupervisorState::Running => "running",
            SupervisorState::Reaping => "reaping",
            SupervisorState::Done => "done",
            SupervisorState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Tracks the state of one execution and refuses illegal transitions.
#[derive(Debug)]
pub struct Lifecycle {
    execution_id: ExecutionId,
    state: SupervisorState,
}

impl Lifecycle {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            state: SupervisorState::Pending,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Move to `next`. Returns false (and stays put) on an illegal transition.
    pub fn advance(&mut self, next: SupervisorState) -> bool {
        if !self.state.can_transition_to(next) {
            log::error!(
                "[{}] illegal lifecycle transition {} -> {}",
                self.execution_id,
                self.state,
                next
            );
            return false;
        }
        log::debug!("[{}] {} -> {}", self.execution_id, self.state, next);
        self.state = next;
        true
    }
}

/// Resource whose ceiling was enforced by the isolation layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    CpuTime,
    Processes,
    FileSize,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Memory => "memory",
            ResourceKind::CpuTime => "cpu_time",
            ResourceKind::Processes => "processes",
            ResourceKind::FileSize => "file_size",
        };
        f.write_str(name)
    }
}

/// Public launch failure category
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchFailureKind {
    InvalidConfiguration,
    ExecutableNotFound,
    PermissionDenied,
    ResourceExhausted,
    WorkspaceUnavailable,
    EngineSetupFailed,
    SpawnFailed,
}

impl LaunchFailureKind {
    /// Categorise an OS-level spawn error
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => LaunchFailureKind::ExecutableNotFound,
            std::io::ErrorKind::PermissionDenied => LaunchFailureKind::PermissionDenied,
            _ => match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::ENOMEM) | Some(libc::EMFILE)
                | Some(libc::ENFILE) => LaunchFailureKind::ResourceExhausted,
                Some(libc::EPERM) => LaunchFailureKind::PermissionDenied,
                _ => LaunchFailureKind::SpawnFailed,
            },
        }
    }
}

/// Launch failure. `detail` is for logs only and may contain host paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchFailure {
    pub kind: LaunchFailureKind,
    pub detail: String,
}

impl LaunchFailure {
    pub fn new(kind: LaunchFailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

/// Terminal outcome of one execution. Exactly one per execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed { exit_code: i32 },
    TimedOut,
    Signaled { signal: i32 },
    OutputLimitExceeded,
    ResourceLimitExceeded { which: ResourceKind },
    LaunchFailed { reason: LaunchFailure },
    Cancelled,
    /// Supervision failed after launch. The process was still killed and reaped.
    InternalError { reason: String },
}

impl ExecutionOutcome {
    /// Short label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed { .. } => "completed",
            ExecutionOutcome::TimedOut => "timed_out",
            ExecutionOutcome::Signaled { .. } => "signaled",
            ExecutionOutcome::OutputLimitExceeded => "output_limit_exceeded",
            ExecutionOutcome::ResourceLimitExceeded { .. } => "resource_limit_exceeded",
            ExecutionOutcome::LaunchFailed { .. } => "launch_failed",
            ExecutionOutcome::Cancelled => "cancelled",
            ExecutionOutcome::InternalError { .. } => "internal_error",
        }
    }

    /// Terminal state the lifecycle enters for this outcome
    pub fn terminal_state(&self) -> SupervisorState {
        match self {
            ExecutionOutcome::Cancelled | ExecutionOutcome::InternalError { .. } => {
                SupervisorState::Aborted
            }
            _ => SupervisorState::Done,
        }
    }
}

/// Captured stdout/stderr, frozen at reap.
#[derive(Clone, Debug, Default)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// When the stdout cap was hit
    pub stdout_capped_at: Option<Instant>,
    /// When the stderr cap was hit
    pub stderr_capped_at: Option<Instant>,
}

impl CapturedOutput {
    pub fn any_truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }

    /// Earliest instant any stream hit its cap
    pub fn first_cap_hit(&self) -> Option<Instant> {
        match (self.stdout_capped_at, self.stderr_capped_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Usage accounting collected at reap (logged, not encoded)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub cpu_time_ms: u64,
    pub peak_memory_bytes: u64,
}

/// The unit returned to the caller; immutable once built.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub output: CapturedOutput,
    pub outcome: ExecutionOutcome,
    pub duration: Duration,
    pub usage: UsageStats,
}
