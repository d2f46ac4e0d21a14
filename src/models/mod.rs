//! Data models for the warehouse pool.
//!
//! This module re-exports all model types used throughout the crate.

pub mod query;

// Re-export commonly used types
pub use query::{QueryParam, Row};
