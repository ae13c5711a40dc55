//! Safety and cleanup
//!
//! Execution-scoped workspaces and symlink-safe removal of everything the
//! sandboxed program wrote.

pub mod safe_cleanup;
pub mod workspace;
