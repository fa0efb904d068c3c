//! Kiln Core
//!
//! Core domain types, traits, and error handling for Kiln.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod build;
pub mod error;
pub mod host;
pub mod host_query;
pub mod ids;
pub mod pair;
pub mod patch;
pub mod ports;
pub mod project;
pub mod task;
pub mod version;

pub use error::{Error, Result};
pub use ids::*;
