//! Permuter - randomized source permutation search
//!
//! Searches for C source variants whose compiled output matches a target
//! object file. The crate coordinates the search: it interleaves seeds across
//! targets, fans evaluation out to local worker threads and remote servers,
//! and records every candidate that improves on what has been seen so far.

pub mod config;
pub mod coordinator;
pub mod distributed;
pub mod error;
pub mod eval;
pub mod output;
pub mod seed;
pub mod stats;
pub mod target;
pub mod util;
pub mod worker;

pub use error::{RunError, ValidationError};

/// Result type used throughout permuter
pub type Result<T> = anyhow::Result<T>;
