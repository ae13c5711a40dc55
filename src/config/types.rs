/// Core types and structures for the runbox supervisor
use crate::core::types::LaunchFailure;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of one execution.
/// Used for correlation, scratch-path derivation and keyed cancellation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Allocate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Per-request limit overrides. Each field may only narrow the server ceiling.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default)]
    pub cpu_time_ms: Option<u64>,
    #[serde(default)]
    pub wall_time_ms: Option<u64>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub output_bytes: Option<u64>,
}

/// Execution request as accepted from the serving layer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Target runtime identifier (e.g. "python", "sh")
    pub runtime: String,
    /// Untrusted source code
    pub source: String,
    /// Optional stdin payload
    #[serde(default)]
    pub stdin: Option<String>,
    /// Optional limit overrides
    #[serde(default)]
    pub limits: LimitOverrides,
}

impl ExecutionRequest {
    pub fn new(runtime: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            source: source.into(),
            stdin: None,
            limits: LimitOverrides::default(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }
}

/// Server-wide hard ceilings. A request may narrow these but never widen them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerLimits {
    pub max_cpu_time_ms: u64,
    pub max_wall_time_ms: u64,
    pub max_memory_bytes: u64,
    pub max_output_bytes: u64,
    pub max_concurrent_executions: usize,
    /// Processes/threads the sandboxed program may spawn
    pub max_processes: u32,
    /// Largest file the program may create in its scratch directory
    pub max_file_size_bytes: u64,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    /// Delay between SIGTERM and SIGKILL on forced termination
    pub kill_grace_ms: u64,
    /// How long output readers may keep draining after the process is gone
    pub output_drain_ms: u64,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_cpu_time_ms: 10_000,
            max_wall_time_ms: 20_000,
            max_memory_bytes: 256 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            max_concurrent_executions: 8,
            max_processes: 16,
            max_file_size_bytes: 16 * 1024 * 1024,
            max_source_bytes: 1024 * 1024,
            max_stdin_bytes: 4 * 1024 * 1024,
            kill_grace_ms: 200,
            output_drain_ms: 500,
        }
    }
}

/// Limits resolved for one execution
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedLimits {
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub memory_bytes: u64,
    pub output_bytes: usize,
    pub max_processes: u32,
    pub file_size_bytes: u64,
}

/// Network exposure for sandboxed code
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// No network namespace access (isolated loopback only)
    #[default]
    Disabled,
    /// Share the host network. Trusted debugging only.
    Host,
}

/// Filesystem exposure for one execution
#[derive(Clone, Debug, PartialEq)]
pub struct FilesystemPolicy {
    pub read_only_root: bool,
    /// Execution-scoped directory holding the scratch dir and engine report
    pub execution_dir: PathBuf,
    /// Writable scratch directory visible to the program
    pub scratch_dir: PathBuf,
    /// Additional host paths exposed read-only
    pub read_only_binds: Vec<PathBuf>,
}

/// Program to run inside the sandbox
#[derive(Clone, Debug, PartialEq)]
pub struct ProgramSpec {
    pub argv: Vec<String>,
    /// Source file name relative to the scratch dir, when the runtime reads source from disk
    pub source_file: Option<String>,
}

/// Concrete isolation configuration. Derived once per execution; never mutated.
#[derive(Clone, Debug)]
pub struct IsolationConfig {
    pub execution_id: ExecutionId,
    pub runtime: String,
    pub limits: ResolvedLimits,
    pub filesystem: FilesystemPolicy,
    pub network: NetworkPolicy,
    /// Syscall policy name handed to the isolation engine
    pub seccomp_profile: String,
    pub program: ProgramSpec,
    pub environment: Vec<(String, String)>,
    pub kill_grace: Duration,
    pub output_drain: Duration,
}

/// Reason an admission was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AtCapacity,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::AtCapacity => write!(f, "at_capacity"),
        }
    }
}

/// Custom error types for runbox
#[derive(Error, Debug)]
pub enum RunboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Admission rejected: {0}")]
    AdmissionRejected(RejectReason),

    #[error("Launch failed: {0}")]
    Launch(LaunchFailure),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),
}

impl RunboxError {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            RunboxError::Io(_) => "io_error",
            RunboxError::Config(_) => "config_error",
            RunboxError::AdmissionRejected(_) => "admission_rejected",
            RunboxError::Launch(_) => "launch_failed",
            RunboxError::Process(_) => "process_error",
            RunboxError::Workspace(_) => "workspace_error",
            RunboxError::Cgroup(_) => "cgroup_error",
        }
    }
}

impl From<nix::errno::Errno> for RunboxError {
    fn from(err: nix::errno::Errno) -> Self {
        RunboxError::Process(err.to_string())
    }
}

/// Result type alias for runbox operations
pub type Result<T> = std::result::Result<T, RunboxError>;
