//! Strata Core - shared types used across the strata crates.
//!
//! Currently this is the error taxonomy and the `Result` alias that the
//! image library and the command-line orchestrator both return.

pub mod error;

pub use error::{Result, StrataError};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
