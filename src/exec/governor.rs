//! Per-execution deadline enforcement.
//!
//! One governor thread per execution waits for the first of disarm, trigger
//! (cancellation) or the deadline. On fire it signals the whole process group:
//! SIGTERM, then SIGKILL after the grace period unless disarmed in between.

use crate::config::types::Result;
use crate::kernel::process::ProcessGroup;
use crossbeam_channel::{after, at, bounded, select, Receiver, Sender};
use nix::sys::signal::Signal;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Why the governor fired
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FireCause {
    Deadline,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FireEvent {
    pub cause: FireCause,
    pub at: Instant,
}

/// What the governor did before it was disarmed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KillReport {
    pub fired: Option<FireEvent>,
    pub term_sent: bool,
    pub kill_sent: bool,
}

/// Owned handle on an armed governor. Not `Clone`; dropping it disarms.
pub struct TimerToken {
    disarm_tx: Option<Sender<()>>,
    trigger_tx: Sender<()>,
    thread: Option<JoinHandle<KillReport>>,
}

impl TimerToken {
    /// Fire now with [`FireCause::Cancelled`]. No-op once fired or disarmed.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Stop the governor and collect its report. No signal is sent after this returns.
    pub fn disarm(mut self) -> KillReport {
        self.disarm_inner()
    }

    fn disarm_inner(&mut self) -> KillReport {
        if let Some(tx) = self.disarm_tx.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                log::error!("governor thread panicked");
                KillReport::default()
            }),
            None => KillReport::default(),
        }
    }
}

impl Drop for TimerToken {
    fn drop(&mut self) {
        self.disarm_inner();
    }
}

pub struct TimeoutGovernor;

impl TimeoutGovernor {
    /// Arm a governor for `group`. The returned receiver yields one [`FireEvent`] if it fires.
    pub fn arm(
        group: ProcessGroup,
        deadline: Instant,
        grace: Duration,
    ) -> Result<(TimerToken, Receiver<FireEvent>)> {
        let (disarm_tx, disarm_rx) = bounded::<()>(1);
        let (trigger_tx, trigger_rx) = bounded::<()>(1);
        let (fired_tx, fired_rx) = bounded::<FireEvent>(1);

        let thread = std::thread::Builder::new()
            .name(format!("runbox-governor-{}", group.id()))
            .spawn(move || govern(group, deadline, grace, disarm_rx, trigger_rx, fired_tx))?;

        Ok((
            TimerToken {
                disarm_tx: Some(disarm_tx),
                trigger_tx,
                thread: Some(thread),
            },
            fired_rx,
        ))
    }
}

fn govern(
    group: ProcessGroup,
    deadline: Instant,
    grace: Duration,
    disarm_rx: Receiver<()>,
    trigger_rx: Receiver<()>,
    fired_tx: Sender<FireEvent>,
) -> KillReport {
    let mut report = KillReport::default();

    let cause = select! {
        recv(disarm_rx) -> _ => return report,
        recv(trigger_rx) -> msg => match msg {
            Ok(()) => FireCause::Cancelled,
            Err(_) => return report,
        },
        recv(at(deadline)) -> _ => FireCause::Deadline,
    };

    let event = FireEvent {
        cause,
        at: Instant::now(),
    };
    report.fired = Some(event);
    let _ = fired_tx.send(event);

    match group.signal(Signal::SIGTERM) {
        Ok(sent) => report.term_sent = sent,
        Err(e) => log::warn!("SIGTERM to group {} failed: {}", group.id(), e),
    }
    log::info!("Governor fired ({:?}); SIGTERM sent to group {}", cause, group.id());

    select! {
        recv(disarm_rx) -> _ => return report,
        recv(after(grace)) -> _ => {},
    }

    match group.signal(Signal::SIGKILL) {
        Ok(sent) => report.kill_sent = sent,
        Err(e) => log::warn!("SIGKILL to group {} failed: {}", group.id(), e),
    }
    if report.kill_sent {
        log::info!("Grace period expired; SIGKILL sent to group {}", group.id());
    }
    report
}
