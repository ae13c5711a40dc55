//! runbox: a sandboxed execution supervisor
//!
//! Accepts an untrusted snippet plus a runtime, runs it under an isolation
//! engine with wall-clock, CPU, memory and output limits, and maps whatever
//! happened into exactly one well-defined result.
//!
//! # Architecture
//!
//! ## Configuration ([`config`])
//! - [`config::server`]: Server configuration loading
//! - [`config::validator`]: Startup validation of ceilings and paths
//! - [`config::builder`]: Request to isolation config translation
//! - [`config::types`]: Shared types and the crate error
//!
//! ## Runtimes ([`runtime`])
//! - Built-in adapters (`python`, `node`, `sh`, `bash`) and configured command runtimes
//!
//! ## Isolation Engines ([`engine`])
//! - [`engine::ExternalEngine`]: Engine binary plus report file
//! - [`engine::LocalEngine`]: Process group and rlimits, for development
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::process`]: Group signalling, non-reaping exit observation, reaping
//!
//! ## Execution Control ([`exec`])
//! - [`exec::launcher`]: Workspace, source delivery and spawn
//! - [`exec::governor`]: Deadline timer with TERM-then-KILL escalation
//!
//! ## Core ([`core`])
//! - [`core::supervisor`]: Per-execution lifecycle and reaping
//! - [`core::pool`]: Reject-fast admission control and keyed cancellation
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::classify`]: Outcome classification over collected evidence
//! - [`verdict::encoder`]: External result contract
//!
//! ## Supporting modules
//! - [`utils::output`]: Capped concurrent stdout/stderr collection
//! - [`safety::workspace`]: Execution-scoped scratch directories
//! - [`observability`]: Audit events and metrics
//!
//! # Invariants
//!
//! 1. Every launched process is reaped, and every admitted execution yields one result
//! 2. No signal is sent to a process group after its leader has been reaped
//! 3. Per-request limits may only narrow the server ceilings
//! 4. Encoded results never carry host paths, pids or engine details

// Configuration & Policy
pub mod config;

// Runtime adapters
pub mod runtime;

// Isolation engines
pub mod engine;

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Lifecycle, supervisor and pool
pub mod core;

// Classification & Encoding
pub mod verdict;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Utilities
pub mod utils;

// CLI entrypoint
pub mod cli;

pub use config::server::ServerConfig;
pub use config::types::{ExecutionId, ExecutionRequest, LimitOverrides, Result, RunboxError};
pub use core::pool::{Admission, ExecutionPool};
pub use core::types::{ExecutionOutcome, ExecutionResult, ResourceKind};
pub use verdict::encoder::{EncodedResult, ResultEncoder};
