//! Error handling for framegate
//!
//! This module defines the top-level error type and a Result alias. Graph
//! and filter compilation carry their own error enums ([`BuildError`],
//! [`DispatchError`]) which convert into [`GatewayError`] when a pipeline is
//! built. Per-frame failures ([`crate::protocol::FrameError`]) never leave
//! the decode worker: they are logged and counted there.

use crate::dispatch::DispatchError;
use crate::protocol::BuildError;
use thiserror::Error;

/// Main error type for framegate operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Protocol graph construction failed
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// Sink filter setup or evaluation failed
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<GatewayError>,
    },
}

impl GatewayError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        GatewayError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for framegate operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
