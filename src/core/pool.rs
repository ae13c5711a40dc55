//! Admission control.
//!
//! A single atomic counter bounds concurrent executions; there is no queue.
//! The slot is held from admission until the execution's result is built and
//! released by dropping the [`Permit`].

use crate::config::builder::IsolationConfigBuilder;
use crate::config::server::ServerConfig;
use crate::config::types::{ExecutionId, ExecutionRequest, RejectReason, Result, RunboxError};
use crate::core::supervisor::Supervisor;
use crate::core::types::ExecutionResult;
use crate::engine::{self, IsolationEngine};
use crate::observability::metrics::{MetricsSnapshot, SupervisorMetrics};
use crate::runtime::RuntimeRegistry;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type CancelRegistry = Mutex<HashMap<ExecutionId, Sender<()>>>;

fn lock_registry(registry: &CancelRegistry) -> MutexGuard<'_, HashMap<ExecutionId, Sender<()>>> {
    // Entries are plain senders; a panic elsewhere cannot leave them inconsistent
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Concurrency slot. Releases the slot and the cancellation entry on drop.
struct Permit {
    execution_id: ExecutionId,
    active: Arc<AtomicUsize>,
    cancels: Arc<CancelRegistry>,
    metrics: Arc<SupervisorMetrics>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        lock_registry(&self.cancels).remove(&self.execution_id);
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.metrics.running.dec();
    }
}

/// An admitted execution, holding its slot until [`Admission::run`] returns.
pub struct Admission {
    execution_id: ExecutionId,
    request: ExecutionRequest,
    cancel_rx: Receiver<()>,
    supervisor: Arc<Supervisor>,
    _permit: Permit,
}

impl Admission {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Run on the calling thread. The slot is released when this returns.
    pub fn run(self) -> ExecutionResult {
        self.supervisor
            .run(self.execution_id.clone(), &self.request, self.cancel_rx.clone())
    }
}

/// Bounded, reject-fast pool of executions
pub struct ExecutionPool {
    capacity: usize,
    active: Arc<AtomicUsize>,
    cancels: Arc<CancelRegistry>,
    server: Arc<ServerConfig>,
    runtimes: Arc<RuntimeRegistry>,
    supervisor: Arc<Supervisor>,
    metrics: Arc<SupervisorMetrics>,
}

impl ExecutionPool {
    /// Pool using the engine named in the configuration
    pub fn from_config(server: ServerConfig) -> Result<Self> {
        let engine = engine::from_config(&server.engine);
        Self::new(server, engine)
    }

    pub fn new(server: ServerConfig, engine: Arc<dyn IsolationEngine>) -> Result<Self> {
        server.validate()?;
        let runtimes = Arc::new(RuntimeRegistry::from_specs(&server.runtimes)?);
        let server = Arc::new(server);
        let metrics = Arc::new(SupervisorMetrics::new());
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&server),
            Arc::clone(&runtimes),
            engine,
            Arc::clone(&metrics),
        ));

        log::info!(
            "Execution pool ready: capacity {}, scratch root {}",
            server.limits.max_concurrent_executions,
            server.scratch_root.display()
        );

        Ok(Self {
            capacity: server.limits.max_concurrent_executions,
            active: Arc::new(AtomicUsize::new(0)),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            server,
            runtimes,
            supervisor,
            metrics,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn runtimes(&self) -> &RuntimeRegistry {
        &self.runtimes
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn try_acquire(&self) -> bool {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return false;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Validate and admit a request, or reject it without spawning anything.
    pub fn admit(&self, request: ExecutionRequest) -> Result<Admission> {
        let builder = IsolationConfigBuilder::new(&self.server, &self.runtimes);
        if let Err(e) = builder.check(&request) {
            self.metrics.rejected_config.inc();
            log::info!("Rejected request for runtime '{}': {}", request.runtime, e);
            return Err(e);
        }

        if !self.try_acquire() {
            self.metrics.rejected_at_capacity.inc();
            log::info!("Rejected request: {} executions already running", self.capacity);
            return Err(RunboxError::AdmissionRejected(RejectReason::AtCapacity));
        }

        let execution_id = ExecutionId::new();
        let (cancel_tx, cancel_rx) = bounded(1);
        lock_registry(&self.cancels).insert(execution_id.clone(), cancel_tx);
        self.metrics.admitted.inc();
        self.metrics.running.inc();

        Ok(Admission {
            execution_id: execution_id.clone(),
            request,
            cancel_rx,
            supervisor: Arc::clone(&self.supervisor),
            _permit: Permit {
                execution_id,
                active: Arc::clone(&self.active),
                cancels: Arc::clone(&self.cancels),
                metrics: Arc::clone(&self.metrics),
            },
        })
    }

    /// Admit and run on the calling thread
    pub fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        Ok(self.admit(request)?.run())
    }

    /// Request cancellation of a running execution. Returns false if the id is unknown.
    pub fn cancel(&self, execution_id: &ExecutionId) -> bool {
        match lock_registry(&self.cancels).get(execution_id) {
            Some(tx) => {
                let _ = tx.try_send(());
                log::info!("[{}] cancellation delivered", execution_id);
                true
            }
            None => false,
        }
    }
}
