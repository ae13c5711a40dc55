//! Starts one isolated process per execution.

use crate::config::types::{ExecutionId, IsolationConfig, Result, RunboxError};
use crate::core::types::{LaunchFailure, LaunchFailureKind};
use crate::engine::{missing_controls, IsolationEngine};
use crate::kernel::process::{self, ProcessGroup, ReapStatus};
use crate::safety::workspace::ExecutionWorkspace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{ChildStdin, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Live subordinate process. Owned by exactly one supervisor; not `Clone`.
///
/// If dropped without [`ExecutionHandle::reap`], the group is killed and the
/// leader reaped so no zombie outlives the handle.
pub struct ExecutionHandle {
    execution_id: ExecutionId,
    pid: Pid,
    group: ProcessGroup,
    started_at: Instant,
    stdout: Option<File>,
    stderr: Option<File>,
    stdin_writer: Option<JoinHandle<()>>,
    workspace: ExecutionWorkspace,
    engine: Arc<dyn IsolationEngine>,
    reaped: bool,
    released: bool,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn group(&self) -> ProcessGroup {
        self.group
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Engine report location for this execution
    pub fn report_path(&self) -> PathBuf {
        self.workspace.report_path()
    }

    /// Hand the output pipes to a collector. Returns None after the first call.
    pub fn take_output(&mut self) -> Option<(File, File)> {
        match (self.stdout.take(), self.stderr.take()) {
            (Some(out), Some(err)) => Some((out, err)),
            _ => None,
        }
    }

    /// Reap the leader. Call only after the governor is disarmed.
    pub fn reap(&mut self) -> Result<ReapStatus> {
        if self.reaped {
            return Err(RunboxError::Process(format!(
                "[{}] leader {} already reaped",
                self.execution_id, self.pid
            )));
        }
        let status = process::reap(self.pid)?;
        self.reaped = true;

        if let Some(writer) = self.stdin_writer.take() {
            // Only join a finished writer: a process that escaped the group may still hold stdin.
            if writer.is_finished() {
                let _ = writer.join();
            }
        }
        Ok(status)
    }

    /// Release engine state (e.g. the execution cgroup) and remove the scratch directory
    pub fn cleanup(&mut self) -> Result<()> {
        let released = self.release_engine();
        self.workspace.cleanup()?;
        released
    }

    fn release_engine(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.engine.release(&self.execution_id)
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if !self.reaped {
            log::warn!(
                "[{}] handle dropped before reap; killing group {}",
                self.execution_id,
                self.group.id()
            );
            let _ = self.group.signal(Signal::SIGKILL);
            if let Err(e) = process::reap(self.pid) {
                log::warn!("[{}] reap on drop failed: {}", self.execution_id, e);
            }
            self.reaped = true;
        }
        if let Err(e) = self.release_engine() {
            log::warn!("[{}] engine release on drop failed: {}", self.execution_id, e);
        }
    }
}

fn spawn_stdin_writer(mut stdin: ChildStdin, payload: Vec<u8>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("runbox-stdin".to_string())
        .spawn(move || {
            if let Err(e) = stdin.write_all(&payload) {
                // The program is free to exit without reading its input
                if e.kind() != ErrorKind::BrokenPipe {
                    log::debug!("stdin writer stopped: {}", e);
                }
            }
            // stdin closes on drop
        })
}

/// Launches subordinate processes through an isolation engine.
#[derive(Clone)]
pub struct ProcessLauncher {
    engine: Arc<dyn IsolationEngine>,
}

impl ProcessLauncher {
    pub fn new(engine: Arc<dyn IsolationEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &dyn IsolationEngine {
        self.engine.as_ref()
    }

    /// Create the workspace, deliver the source, spawn the program in a new
    /// process group and start feeding stdin.
    pub fn launch(
        &self,
        config: &IsolationConfig,
        source: &str,
        stdin: Option<&[u8]>,
    ) -> std::result::Result<ExecutionHandle, LaunchFailure> {
        let id = &config.execution_id;

        let workspace = ExecutionWorkspace::create(&config.filesystem)
            .map_err(|e| LaunchFailure::new(LaunchFailureKind::WorkspaceUnavailable, e.to_string()))?;

        if let Some(file_name) = &config.program.source_file {
            workspace
                .write_source(file_name, source.as_bytes())
                .map_err(|e| {
                    LaunchFailure::new(LaunchFailureKind::WorkspaceUnavailable, e.to_string())
                })?;
        }

        let mut cmd = self
            .engine
            .command(config, &workspace.report_path())
            .map_err(|e| {
                let kind = match e {
                    RunboxError::Config(_) => LaunchFailureKind::InvalidConfiguration,
                    _ => LaunchFailureKind::EngineSetupFailed,
                };
                LaunchFailure::new(kind, e.to_string())
            })?;

        cmd.process_group(0)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let missing = missing_controls(self.engine.as_ref(), config);
        if !missing.is_empty() {
            log::warn!(
                "[{}] engine '{}' does not enforce: {}",
                id,
                self.engine.name(),
                missing.join(", ")
            );
        }

        // On failure the workspace drops here, removing only the scratch directory
        let mut child = cmd.spawn().map_err(|e| {
            if let Err(release) = self.engine.release(id) {
                log::warn!("[{}] {}", id, release);
            }
            LaunchFailure::new(
                LaunchFailureKind::from_io(&e),
                format!("{} engine spawn failed: {}", self.engine.name(), e),
            )
        })?;

        let started_at = Instant::now();
        let pid = Pid::from_raw(child.id() as i32);

        let stdout = child.stdout.take().map(|s| File::from(OwnedFd::from(s)));
        let stderr = child.stderr.take().map(|s| File::from(OwnedFd::from(s)));

        let mut handle = ExecutionHandle {
            execution_id: id.clone(),
            pid,
            group: ProcessGroup::new(pid),
            started_at,
            stdout,
            stderr,
            stdin_writer: None,
            workspace,
            engine: Arc::clone(&self.engine),
            reaped: false,
            released: false,
        };

        if let (Some(pipe), Some(payload)) = (child.stdin.take(), stdin) {
            // Dropping the handle on failure kills and reaps the leader
            let writer = spawn_stdin_writer(pipe, payload.to_vec()).map_err(|e| {
                LaunchFailure::new(LaunchFailureKind::ResourceExhausted, e.to_string())
            })?;
            handle.stdin_writer = Some(writer);
        }

        log::info!(
            "[{}] launched {} (pid {}) via {} engine",
            id,
            config.runtime,
            pid,
            self.engine.name()
        );
        Ok(handle)
    }
}
