//! cgroup v2 memory and pids control for the local engine
//!
//! A delegation root (default `/sys/fs/cgroup/runbox`) gets the `memory` and,
//! when available, `pids` controllers enabled for its children. Each execution
//! runs in `<root>/<execution_id>`, so the engine can find its cgroup again
//! from the isolation config alone.

use crate::config::types::{ExecutionId, Result, RunboxError};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/runbox";

const REMOVE_ATTEMPTS: u32 = 50;
const REMOVE_BACKOFF: Duration = Duration::from_millis(5);

fn cgroup_err(what: &str, path: &Path, e: std::io::Error) -> RunboxError {
    RunboxError::Cgroup(format!("{} {}: {}", what, path.display(), e))
}

fn read_controllers(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).map_err(|e| cgroup_err("Failed to read", path, e))?;
    Ok(content.split_whitespace().map(str::to_string).collect())
}

/// Enable `controller` for the children of `dir` unless it already is
fn enable_controller(dir: &Path, controller: &str) -> Result<()> {
    let subtree = dir.join("cgroup.subtree_control");
    if read_controllers(&subtree)?.iter().any(|c| c == controller) {
        return Ok(());
    }
    fs::write(&subtree, format!("+{}", controller))
        .map_err(|e| cgroup_err(&format!("Failed to enable {} in", controller), &subtree, e))
}

/// Value of `key` in a flat keyed file such as `memory.events`
fn keyed_value(content: &str, key: &str) -> u64 {
    content
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Prepared delegation root
#[derive(Clone, Debug)]
pub struct CgroupRoot {
    path: PathBuf,
    pids: bool,
}

impl CgroupRoot {
    /// Prepare `path` for per-execution children. None when cgroup v2 is not
    /// mounted there, not writable, or has no memory controller.
    pub fn detect(path: &Path) -> Option<Self> {
        match Self::prepare(path) {
            Ok(root) => {
                log::info!(
                    "cgroup v2 root {} ready (pids controller: {})",
                    root.path.display(),
                    root.pids
                );
                Some(root)
            }
            Err(e) => {
                log::info!("cgroup v2 unavailable at {}: {}", path.display(), e);
                None
            }
        }
    }

    fn prepare(path: &Path) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| RunboxError::Cgroup(format!("{} has no parent", path.display())))?;
        let offered = read_controllers(&parent.join("cgroup.controllers"))?;
        if !offered.iter().any(|c| c == "memory") {
            return Err(RunboxError::Cgroup(format!(
                "memory controller not offered by {}",
                parent.display()
            )));
        }

        enable_controller(parent, "memory")?;
        let pids_offered = offered.iter().any(|c| c == "pids");
        if pids_offered {
            if let Err(e) = enable_controller(parent, "pids") {
                log::debug!("pids controller left disabled: {}", e);
            }
        }

        match fs::create_dir(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(cgroup_err("Failed to create cgroup", path, e)),
        }

        let available = read_controllers(&path.join("cgroup.controllers"))?;
        if !available.iter().any(|c| c == "memory") {
            return Err(RunboxError::Cgroup(format!(
                "memory controller not delegated to {}",
                path.display()
            )));
        }
        enable_controller(path, "memory")?;
        let pids = available.iter().any(|c| c == "pids") && enable_controller(path, "pids").is_ok();

        Ok(Self {
            path: path.to_path_buf(),
            pids,
        })
    }

    /// Root assumed to be prepared already, for exercising the readers
    #[cfg(test)]
    pub(crate) fn assume(path: &Path, pids: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            pids,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether children get a `pids.max`
    pub fn has_pids(&self) -> bool {
        self.pids
    }

    /// Cgroup belonging to `id`. Does not touch the filesystem.
    pub fn instance(&self, id: &ExecutionId) -> Result<ExecutionCgroup> {
        let name = id.as_str();
        if name.is_empty() || name.starts_with('.') || name.contains('/') {
            return Err(RunboxError::Cgroup(format!(
                "execution id '{}' is not a cgroup name",
                name
            )));
        }
        Ok(ExecutionCgroup {
            path: self.path.join(name),
        })
    }

    /// Create the cgroup for `id` with its memory (and process) ceiling.
    /// A half-configured cgroup is removed before the error is returned.
    pub fn create(
        &self,
        id: &ExecutionId,
        memory_bytes: u64,
        max_processes: Option<u32>,
    ) -> Result<ExecutionCgroup> {
        let cgroup = self.instance(id)?;
        fs::create_dir(&cgroup.path).map_err(|e| cgroup_err("Failed to create cgroup", &cgroup.path, e))?;

        let configured = cgroup
            .set_memory_limit(memory_bytes)
            .and_then(|()| match max_processes {
                Some(limit) if self.pids => cgroup.set_process_limit(limit),
                _ => Ok(()),
            });
        if let Err(e) = configured {
            if let Err(cleanup) = cgroup.remove() {
                log::warn!("[{}] {}", id, cleanup);
            }
            return Err(e);
        }
        Ok(cgroup)
    }
}

/// One execution's cgroup
#[derive(Clone, Debug)]
pub struct ExecutionCgroup {
    path: PathBuf,
}

impl ExecutionCgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn set_memory_limit(&self, limit_bytes: u64) -> Result<()> {
        let max = self.path.join("memory.max");
        fs::write(&max, limit_bytes.to_string()).map_err(|e| cgroup_err("Failed to write", &max, e))?;

        // Absent without swap accounting
        let swap = self.path.join("memory.swap.max");
        if swap.exists() {
            fs::write(&swap, "0").map_err(|e| cgroup_err("Failed to write", &swap, e))?;
        }

        // One OOM kill takes the whole execution down
        let group = self.path.join("memory.oom.group");
        if group.exists() {
            if let Err(e) = fs::write(&group, "1") {
                log::warn!("Failed to set {}: {}", group.display(), e);
            }
        }
        Ok(())
    }

    fn set_process_limit(&self, limit: u32) -> Result<()> {
        let max = self.path.join("pids.max");
        fs::write(&max, limit.to_string()).map_err(|e| cgroup_err("Failed to write", &max, e))
    }

    /// `cgroup.procs` opened for writing, for a child to join itself before exec
    pub fn procs_file(&self) -> Result<File> {
        let procs = self.path.join("cgroup.procs");
        OpenOptions::new()
            .write(true)
            .open(&procs)
            .map_err(|e| cgroup_err("Failed to open", &procs, e))
    }

    fn read_keyed(&self, file: &str, key: &str) -> Result<u64> {
        let path = self.path.join(file);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(keyed_value(&content, key)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(cgroup_err("Failed to read", &path, e)),
        }
    }

    /// Processes killed by the OOM killer inside this cgroup
    pub fn oom_kills(&self) -> Result<u64> {
        self.read_keyed("memory.events", "oom_kill")
    }

    /// Forks refused because `pids.max` was reached
    pub fn pids_max_hits(&self) -> Result<u64> {
        self.read_keyed("pids.events", "max")
    }

    /// `memory.peak` where the kernel provides it (5.19+)
    pub fn peak_memory(&self) -> Option<u64> {
        fs::read_to_string(self.path.join("memory.peak"))
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    /// Kill anything left inside and remove the cgroup. Missing is fine.
    pub fn remove(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        // cgroup.kill (5.14+) also reaches members that left the process group
        let kill = self.path.join("cgroup.kill");
        if kill.exists() {
            if let Err(e) = fs::write(&kill, "1") {
                log::debug!("Failed to write {}: {}", kill.display(), e);
            }
        }

        // Killed members leave the cgroup asynchronously
        let mut attempt = 0;
        loop {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < REMOVE_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(REMOVE_BACKOFF);
                }
                Err(e) => return Err(cgroup_err("Failed to remove cgroup", &self.path, e)),
            }
        }
    }
}
