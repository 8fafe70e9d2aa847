/*!
# Error Module

This module defines the error handling infrastructure for LeadFlow.

A consistent error system is essential for:
- Providing clear, actionable error messages
- Distinguishing transient fetch failures from configuration mistakes
- Enabling proper error propagation
- Deciding whether a failed attempt is worth retrying

The module includes:
- The `LeadFlowError` enum that categorizes different error types
- A `Result` type alias for convenience
- Specialized error variants for each subsystem (fetch, storage, engine, etc.)
- Integration with the standard error handling traits

Per-task failures never cross the engine's public API as errors; they are
absorbed by the retry executor and reported through `TaskResult` and engine
events. The variants here are what flows *inside* that machinery.
*/

use std::time::Duration;
use thiserror::Error;

/// Result type alias for LeadFlow operations
pub type Result<T> = std::result::Result<T, LeadFlowError>;

/// Errors that can occur during LeadFlow operations
#[derive(Debug, Error)]
pub enum LeadFlowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LeadFlowError {
    /// Whether a failed attempt with this error is eligible for retry.
    ///
    /// Configuration mistakes will fail the same way on every attempt, so
    /// they are excluded; everything else is treated as transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}
