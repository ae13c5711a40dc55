//! Execution core.
//!
//! Lifecycle types, the per-execution supervisor and the admission pool.

pub mod pool;
pub mod supervisor;
pub mod types;
