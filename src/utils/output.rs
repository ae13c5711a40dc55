/// Bounded stdout/stderr collection
///
/// One reader thread per stream forwards chunks over a channel in write order.
/// When a stream reaches its cap the reader keeps exactly `cap` bytes, stops
/// reading and hands the still-open pipe back to the collector. The writer
/// then blocks on a full pipe instead of dying of SIGPIPE, and the pipe is
/// closed only at `finish`, after the process group is gone.
use crate::config::types::Result;
use crate::core::types::CapturedOutput;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::thread;
use std::time::Instant;

const CHUNK_SIZE: usize = 8192;

enum StreamEvent {
    Chunk(Vec<u8>),
    /// Cap reached; the pipe is parked here so it stays open
    Capped { at: Instant, pipe: File },
    Eof,
    Failed(std::io::Error),
}

fn read_stream(mut pipe: File, cap: usize, tx: Sender<StreamEvent>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0usize;

    loop {
        let remaining = cap - total;
        // One byte past the cap is enough to tell "exactly cap" from "more than cap"
        let want = (remaining + 1).min(CHUNK_SIZE);
        match pipe.read(&mut buf[..want]) {
            Ok(0) => {
                let _ = tx.send(StreamEvent::Eof);
                return;
            }
            Ok(n) if n > remaining => {
                if remaining > 0 {
                    let _ = tx.send(StreamEvent::Chunk(buf[..remaining].to_vec()));
                }
                let _ = tx.send(StreamEvent::Capped {
                    at: Instant::now(),
                    pipe,
                });
                return;
            }
            Ok(n) => {
                total += n;
                if tx.send(StreamEvent::Chunk(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(StreamEvent::Failed(e));
                return;
            }
        }
    }
}

/// Collected state of one stream
#[derive(Default)]
struct StreamState {
    data: Vec<u8>,
    capped_at: Option<Instant>,
    parked: Option<File>,
}

struct StreamReader {
    name: &'static str,
    rx: Receiver<StreamEvent>,
}

impl StreamReader {
    fn spawn(name: &'static str, pipe: File, cap: usize) -> Result<Self> {
        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name(format!("runbox-{}", name))
            .spawn(move || read_stream(pipe, cap, tx))?;
        Ok(Self { name, rx })
    }

    /// Drain until EOF, cap, or `deadline`
    fn drain(self, deadline: Instant) -> StreamState {
        let mut state = StreamState::default();
        loop {
            match self.rx.recv_deadline(deadline) {
                Ok(StreamEvent::Chunk(bytes)) => state.data.extend_from_slice(&bytes),
                Ok(StreamEvent::Capped { at, pipe }) => {
                    state.capped_at = Some(at);
                    state.parked = Some(pipe);
                    break;
                }
                Ok(StreamEvent::Eof) => break,
                Ok(StreamEvent::Failed(e)) => {
                    log::warn!("{} reader failed: {}", self.name, e);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "{} still open after drain deadline; keeping {} bytes",
                        self.name,
                        state.data.len()
                    );
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        state
    }
}

/// Concurrent, capped collector for one execution's stdout and stderr.
pub struct OutputCollector {
    stdout: StreamReader,
    stderr: StreamReader,
}

impl OutputCollector {
    /// Start reader threads. `cap` applies to each stream independently.
    pub fn start(stdout: File, stderr: File, cap: usize) -> Result<Self> {
        Ok(Self {
            stdout: StreamReader::spawn("stdout", stdout, cap)?,
            stderr: StreamReader::spawn("stderr", stderr, cap)?,
        })
    }

    /// Freeze the output. Waits for both streams no later than `deadline`.
    pub fn finish(self, deadline: Instant) -> CapturedOutput {
        let stdout = self.stdout.drain(deadline);
        let stderr = self.stderr.drain(deadline);

        // Parked pipes close here
        drop(stdout.parked);
        drop(stderr.parked);

        CapturedOutput {
            stdout_truncated: stdout.capped_at.is_some(),
            stderr_truncated: stderr.capped_at.is_some(),
            stdout_capped_at: stdout.capped_at,
            stderr_capped_at: stderr.capped_at,
            stdout: stdout.data,
            stderr: stderr.data,
        }
    }
}
