//! Configuration and policy
//!
//! Server configuration, validation, shared types, and the per-execution
//! isolation config builder.

pub mod builder;
pub mod server;
pub mod types;
pub mod validator;
