//! Fatal, startup-only error types.
//!
//! Everything recoverable at runtime (priority elevation failure, RT
//! underrun, an invalid preprocessed frame) is handled locally per the
//! engine's error taxonomy and never reaches this type — see the module
//! docs on [`crate::engine`] for where each case is handled.

use thiserror::Error;

/// Fatal errors that can prevent the engine from starting.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A configuration value was rejected by [`crate::config::Config::validate`].
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Allocation or OS resource acquisition failed during startup (thread
    /// spawn, barrier construction).
    #[error("resource exhaustion during startup: {0}")]
    ResourceExhaustion(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
