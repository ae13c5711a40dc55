//! Outcome classification and result encoding
//!
//! Both are pure functions: classification over immutable evidence, encoding
//! over the finished result.

pub mod classify;
pub mod encoder;
