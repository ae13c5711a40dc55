//! Thin wrappers around Linux process and cgroup v2 primitives.
//!
//! Unsafe syscalls live here (and in engine pre-exec hooks) with SAFETY comments.

pub mod cgroup;
pub mod process;
