//! Output collection utilities

pub mod output;
