//! Process-group signalling, non-reaping exit observation, and reaping.
//!
//! The leader is observed with `waitid(WNOWAIT)` so it stays a zombie until
//! [`reap`] is called. While it is unreaped its pid (and so the pgid) cannot be
//! handed to another process, which is what makes late `killpg` calls safe.

use crate::config::types::{Result, RunboxError};
use crossbeam_channel::{bounded, Receiver};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::time::Instant;

/// How the leader terminated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitEvidence {
    Exited(i32),
    Signaled(i32),
}

impl std::fmt::Display for ExitEvidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitEvidence::Exited(code) => write!(f, "exit code {}", code),
            ExitEvidence::Signaled(sig) => write!(f, "signal {}", sig),
        }
    }
}

/// Exit observed without reaping
#[derive(Clone, Copy, Debug)]
pub struct ExitObservation {
    pub evidence: ExitEvidence,
    /// Taken in the watcher thread as soon as `waitid` returns
    pub observed_at: Instant,
}

/// Final status collected by [`reap`]
#[derive(Clone, Copy, Debug)]
pub struct ReapStatus {
    pub exit: ExitEvidence,
    pub cpu_time_ms: u64,
    pub max_rss_bytes: u64,
}

/// A process group created for one execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessGroup {
    pgid: Pid,
}

impl ProcessGroup {
    pub fn new(pgid: Pid) -> Self {
        Self { pgid }
    }

    pub fn id(&self) -> Pid {
        self.pgid
    }

    /// Signal every member of the group. Returns false if the group no longer exists.
    pub fn signal(&self, signal: Signal) -> Result<bool> {
        match killpg(self.pgid, signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(RunboxError::Process(format!(
                "killpg({}, {}) failed: {}",
                self.pgid, signal, e
            ))),
        }
    }
}

/// Block until `pid` exits, without reaping it.
pub fn wait_exit_nowait(pid: Pid) -> Result<ExitEvidence> {
    loop {
        // SAFETY: siginfo_t is plain data; zeroed is a valid initial value.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` is a valid out-pointer for the duration of the call.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc != 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                e => return Err(RunboxError::Process(format!("waitid({}) failed: {}", pid, e))),
            }
        }

        // SAFETY: waitid succeeded with WEXITED, so the SIGCHLD fields are populated.
        let status = unsafe { info.si_status() };
        return match info.si_code {
            libc::CLD_EXITED => Ok(ExitEvidence::Exited(status)),
            libc::CLD_KILLED | libc::CLD_DUMPED => Ok(ExitEvidence::Signaled(status)),
            other => Err(RunboxError::Process(format!(
                "waitid({}) returned unexpected si_code {}",
                pid, other
            ))),
        };
    }
}

/// Spawn the exit-watcher thread. Exactly one message is sent.
pub fn watch_exit(pid: Pid) -> Result<Receiver<Result<ExitObservation>>> {
    let (tx, rx) = bounded(1);
    std::thread::Builder::new()
        .name(format!("runbox-exit-{}", pid))
        .spawn(move || {
            let observation = wait_exit_nowait(pid).map(|evidence| ExitObservation {
                evidence,
                observed_at: Instant::now(),
            });
            let _ = tx.send(observation);
        })?;
    Ok(rx)
}

/// Reap `pid` and collect its resource usage. Blocks until it has exited.
pub fn reap(pid: Pid) -> Result<ReapStatus> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain data.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        // SAFETY: both out-pointers are valid for the duration of the call.
        let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
        if rc == pid.as_raw() {
            break;
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e => return Err(RunboxError::Process(format!("wait4({}) failed: {}", pid, e))),
        }
    }

    let exit = if libc::WIFEXITED(status) {
        ExitEvidence::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitEvidence::Signaled(libc::WTERMSIG(status))
    } else {
        return Err(RunboxError::Process(format!(
            "wait4({}) returned non-terminal status {:#x}",
            pid, status
        )));
    };

    let cpu_us = timeval_us(usage.ru_utime) + timeval_us(usage.ru_stime);
    Ok(ReapStatus {
        exit,
        cpu_time_ms: cpu_us / 1000,
        // ru_maxrss is in kilobytes on Linux
        max_rss_bytes: (usage.ru_maxrss.max(0) as u64) * 1024,
    })
}

fn timeval_us(tv: libc::timeval) -> u64 {
    (tv.tv_sec.max(0) as u64) * 1_000_000 + (tv.tv_usec.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;
    use std::time::Duration;

    fn spawn_sh(script: &str) -> Pid {
        let child = Command::new("/bin/sh")
            .args(["-c", script])
            .process_group(0)
            .spawn()
            .unwrap();
        Pid::from_raw(child.id() as i32)
    }

    #[test]
    fn observe_then_reap_exit_code() {
        let pid = spawn_sh("exit 7");
        let rx = watch_exit(pid).unwrap();
        let observed = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(observed.evidence, ExitEvidence::Exited(7));

        // Still a zombie: the group can be signalled and the leader reaped once.
        let status = reap(pid).unwrap();
        assert_eq!(status.exit, ExitEvidence::Exited(7));
        assert!(reap(pid).is_err());
    }

    #[test]
    fn group_kill_is_seen_as_signal() {
        let pid = spawn_sh("exec sleep 30");
        let group = ProcessGroup::new(pid);
        assert!(group.signal(Signal::SIGKILL).unwrap());

        let evidence = wait_exit_nowait(pid).unwrap();
        assert_eq!(evidence, ExitEvidence::Signaled(libc::SIGKILL));
        let status = reap(pid).unwrap();
        assert_eq!(status.exit, ExitEvidence::Signaled(libc::SIGKILL));

        assert!(!group.signal(Signal::SIGKILL).unwrap());
    }
}
