//! Engine error taxonomy

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure causes carried by exchanges and returned by engine operations.
///
/// `Clone` so that a failure cause can be copied from a sub-exchange onto its
/// parent, or recorded by a dead-letter channel while the original is kept.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Unknown parameters on {uri}: {}", .keys.join(", "))]
    UnknownParameters { uri: String, keys: Vec<String> },

    #[error("Processing error: {message}")]
    Processing { message: String },

    #[error("Timed out after {}ms: {operation}", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("No consumers available on endpoint: {uri}")]
    NoConsumers { uri: String },

    #[error("Transaction rolled back: {message}")]
    Rollback { message: String },

    #[error("Exchange interrupted by shutdown of route {route_id}")]
    ShutdownInterrupted { route_id: String },

    #[error("Rejected execution by {target}: {reason}")]
    RejectedExecution { target: String, reason: String },
}

/// Coarse classification of an [`EngineError`], used by redelivery predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    UnknownParameters,
    Processing,
    Timeout,
    NoConsumers,
    Rollback,
    ShutdownInterrupted,
    RejectedExecution,
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing { message: message.into() }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout { operation: operation.into(), after }
    }

    pub fn rollback(message: impl Into<String>) -> Self {
        Self::Rollback { message: message.into() }
    }

    pub fn rejected(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RejectedExecution { target: target.into(), reason: reason.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::UnknownParameters { .. } => ErrorKind::UnknownParameters,
            Self::Processing { .. } => ErrorKind::Processing,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NoConsumers { .. } => ErrorKind::NoConsumers,
            Self::Rollback { .. } => ErrorKind::Rollback,
            Self::ShutdownInterrupted { .. } => ErrorKind::ShutdownInterrupted,
            Self::RejectedExecution { .. } => ErrorKind::RejectedExecution,
        }
    }

    /// Stage-level failures that flow through an error handler.
    /// A timeout is a processing failure.
    pub fn is_processing(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Processing | ErrorKind::Timeout | ErrorKind::NoConsumers | ErrorKind::Rollback
        )
    }

    /// Startup-time failures. These abort a route start and are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self.kind(), ErrorKind::Configuration | ErrorKind::UnknownParameters)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
