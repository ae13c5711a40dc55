//! Execution control
//!
//! Launching subordinate processes and enforcing their deadlines.

pub mod governor;
pub mod launcher;
