//! Runtime adapters.
//!
//! The supervisor stays runtime-agnostic. Adapters decide how source reaches the
//! program (file in the scratch dir or a command-line argument) and which
//! interpreter runs it.

pub mod adapter;
pub mod command;
pub mod languages;
pub mod registry;

pub use adapter::{RuntimeAdapter, SourceDelivery};
pub use registry::RuntimeRegistry;
