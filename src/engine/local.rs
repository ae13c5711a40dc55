//! Development engine: process group, rlimits and (when writable) a cgroup v2
//! memory ceiling. No namespaces.
//!
//! Good enough to exercise the supervisor end to end on any Linux host.
//! Never use it for untrusted code.

use crate::config::types::{ExecutionId, IsolationConfig, Result, RunboxError};
use crate::core::types::ResourceKind;
use crate::engine::{EngineReport, IsolationEngine};
use crate::kernel::cgroup::{CgroupRoot, ExecutionCgroup, DEFAULT_CGROUP_ROOT};
use crate::kernel::process::{ExitEvidence, ReapStatus};
use nix::sys::resource::{setrlimit, Resource};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

#[derive(Debug)]
pub struct LocalEngine {
    /// None: memory falls back to RLIMIT_AS and violations go unreported
    cgroup: Option<CgroupRoot>,
}

impl LocalEngine {
    /// Engine using the default cgroup v2 root when it is writable
    pub fn new() -> Self {
        Self::with_cgroup_root(DEFAULT_CGROUP_ROOT)
    }

    pub fn with_cgroup_root(root: impl AsRef<Path>) -> Self {
        let cgroup = CgroupRoot::detect(root.as_ref());
        if cgroup.is_none() {
            log::warn!(
                "local engine caps memory with RLIMIT_AS only: memory violations are not \
                 reported and runtimes that reserve large address ranges (node) fail to start"
            );
        }
        Self { cgroup }
    }

    /// Engine that never touches cgroups
    pub fn rlimit_only() -> Self {
        Self { cgroup: None }
    }

    /// Cgroup root in use, if any
    pub fn memory_cgroup(&self) -> Option<&CgroupRoot> {
        self.cgroup.as_ref()
    }

    fn execution_cgroup(&self, id: &ExecutionId) -> Option<ExecutionCgroup> {
        let root = self.cgroup.as_ref()?;
        match root.instance(id) {
            Ok(cgroup) => Some(cgroup),
            Err(e) => {
                log::warn!("[{}] {}", id, e);
                None
            }
        }
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// RLIMIT_CPU in whole seconds, rounded up
fn cpu_limit_secs(config: &IsolationConfig) -> u64 {
    let ms = config.limits.cpu_time.as_millis() as u64;
    ms.div_ceil(1000).max(1)
}

/// Counter from an execution cgroup; unreadable counts as zero
fn counter(id: &ExecutionId, read: Result<u64>) -> u64 {
    read.unwrap_or_else(|e| {
        log::warn!("[{}] {}", id, e);
        0
    })
}

impl IsolationEngine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    fn command(&self, config: &IsolationConfig, _report_path: &Path) -> Result<Command> {
        let (program, args) = config
            .program
            .argv
            .split_first()
            .ok_or_else(|| RunboxError::Config("empty program argv".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(config.environment.iter().map(|(k, v)| (k, v)))
            .current_dir(&config.filesystem.scratch_dir);

        let memory = config.limits.memory_bytes;
        let cpu = cpu_limit_secs(config);
        let fsize = config.limits.file_size_bytes;

        let procs = match &self.cgroup {
            Some(root) => {
                let cgroup = root.create(
                    &config.execution_id,
                    memory,
                    Some(config.limits.max_processes),
                )?;
                match cgroup.procs_file() {
                    Ok(file) => Some(file),
                    Err(e) => {
                        if let Err(cleanup) = cgroup.remove() {
                            log::warn!("[{}] {}", config.execution_id, cleanup);
                        }
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        // SAFETY: the closure only issues raw syscalls (write, setrlimit, prctl),
        // which are async-signal-safe, and allocates nothing.
        unsafe {
            cmd.pre_exec(move || {
                match &procs {
                    Some(file) => {
                        // "0" moves the writing process
                        if libc::write(file.as_raw_fd(), b"0".as_ptr().cast(), 1) != 1 {
                            return Err(std::io::Error::last_os_error());
                        }
                    }
                    // Address-space cap is the fallback memory limit
                    None => setrlimit(Resource::RLIMIT_AS, memory, memory)?,
                }
                setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
                setrlimit(Resource::RLIMIT_CPU, cpu, cpu + 1)?;
                setrlimit(Resource::RLIMIT_FSIZE, fsize, fsize)?;
                if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        Ok(cmd)
    }

    fn interpret(
        &self,
        config: &IsolationConfig,
        _report_path: &Path,
        status: &ReapStatus,
    ) -> EngineReport {
        let id = &config.execution_id;
        let mut report = EngineReport::from_reap(status);
        let cpu_limit_ms = config.limits.cpu_time.as_millis() as u64;

        let cgroup = self.execution_cgroup(id);
        let (oom_kills, pids_max_hits) = match &cgroup {
            Some(cgroup) => {
                if let Some(peak) = cgroup.peak_memory() {
                    report.usage.peak_memory_bytes = report.usage.peak_memory_bytes.max(peak);
                }
                (
                    counter(id, cgroup.oom_kills()),
                    counter(id, cgroup.pids_max_hits()),
                )
            }
            None => (0, 0),
        };

        let signalled = match status.exit {
            ExitEvidence::Signaled(libc::SIGXCPU) => Some(ResourceKind::CpuTime),
            ExitEvidence::Signaled(libc::SIGXFSZ) => Some(ResourceKind::FileSize),
            // Hard RLIMIT_CPU is delivered as SIGKILL
            ExitEvidence::Signaled(libc::SIGKILL) if status.cpu_time_ms >= cpu_limit_ms => {
                Some(ResourceKind::CpuTime)
            }
            _ => None,
        };

        report.violation = if oom_kills > 0 {
            Some(ResourceKind::Memory)
        } else {
            signalled.or((pids_max_hits > 0).then_some(ResourceKind::Processes))
        };
        report
    }

    fn applied_controls(&self, _config: &IsolationConfig) -> Vec<&'static str> {
        let mut controls = vec!["cpu_limit", "file_size_limit", "no_new_privileges"];
        if let Some(root) = &self.cgroup {
            controls.push("memory_limit");
            if root.has_pids() {
                controls.push("process_limit");
            }
        }
        controls
    }

    fn release(&self, execution_id: &ExecutionId) -> Result<()> {
        match self.execution_cgroup(execution_id) {
            Some(cgroup) => cgroup.remove(),
            None => Ok(()),
        }
    }
}
