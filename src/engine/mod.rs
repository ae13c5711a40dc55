//! Isolation engine seam
//!
//! An engine turns an [`IsolationConfig`] into the command that runs the
//! program under isolation, and afterwards turns whatever evidence it left
//! behind into an [`EngineReport`]. The launcher owns spawning; engines never
//! spawn anything themselves.

pub mod external;
pub mod local;

pub use external::ExternalEngine;
pub use local::LocalEngine;

use crate::config::server::EngineConfig;
use crate::config::types::{ExecutionId, IsolationConfig, NetworkPolicy, Result};
use crate::core::types::{ResourceKind, UsageStats};
use crate::kernel::process::{ExitEvidence, ReapStatus};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

/// What the engine says happened to the payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineReport {
    /// Payload termination (may differ from the engine process's own status)
    pub exit: ExitEvidence,
    pub violation: Option<ResourceKind>,
    /// The engine's own wall-clock timer fired
    pub engine_timed_out: bool,
    /// The engine failed before the payload ran
    pub setup_failure: Option<String>,
    pub usage: UsageStats,
}

impl EngineReport {
    /// Report built only from the reaped leader
    pub fn from_reap(status: &ReapStatus) -> Self {
        Self {
            exit: status.exit,
            violation: None,
            engine_timed_out: false,
            setup_failure: None,
            usage: UsageStats {
                cpu_time_ms: status.cpu_time_ms,
                peak_memory_bytes: status.max_rss_bytes,
            },
        }
    }
}

/// Isolation engine contract.
pub trait IsolationEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Build (but do not spawn) the command for `config`.
    /// Process group and stdio are set by the launcher.
    fn command(&self, config: &IsolationConfig, report_path: &Path) -> Result<Command>;

    /// Interpret the engine's evidence once the leader has been reaped
    fn interpret(
        &self,
        config: &IsolationConfig,
        report_path: &Path,
        status: &ReapStatus,
    ) -> EngineReport;

    /// Controls from [`configured_controls`] this engine actually enforces
    fn applied_controls(&self, config: &IsolationConfig) -> Vec<&'static str>;

    /// Drop per-execution host state created by [`IsolationEngine::command`].
    /// Called once the leader is reaped, or when spawning failed. Idempotent.
    fn release(&self, _execution_id: &ExecutionId) -> Result<()> {
        Ok(())
    }
}

/// Controls an isolation config asks for
pub fn configured_controls(config: &IsolationConfig) -> Vec<&'static str> {
    let mut controls = vec![
        "pid_namespace",
        "mount_namespace",
        "memory_limit",
        "cpu_limit",
        "process_limit",
        "file_size_limit",
        "seccomp",
        "no_new_privileges",
    ];
    if config.network == NetworkPolicy::Disabled {
        controls.push("network_namespace");
    }
    if config.filesystem.read_only_root {
        controls.push("read_only_root");
    }
    controls
}

/// Configured controls the engine does not enforce
pub fn missing_controls(engine: &dyn IsolationEngine, config: &IsolationConfig) -> Vec<&'static str> {
    let applied = engine.applied_controls(config);
    configured_controls(config)
        .into_iter()
        .filter(|control| !applied.contains(control))
        .collect()
}

/// Instantiate the configured engine
pub fn from_config(config: &EngineConfig) -> Arc<dyn IsolationEngine> {
    match config {
        EngineConfig::Local { cgroup_root } => match cgroup_root {
            Some(root) => Arc::new(LocalEngine::with_cgroup_root(root)),
            None => Arc::new(LocalEngine::new()),
        },
        EngineConfig::External { path, args } => {
            Arc::new(ExternalEngine::new(path.clone(), args.clone()))
        }
    }
}
