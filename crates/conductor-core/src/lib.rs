//! Core types and error definitions for the Conductor task orchestrator.
//!
//! This crate provides the foundational types shared across all Conductor
//! crates: the unified error enum and the tagged payload used for task context,
//! step parameters and step results.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`Payload`] — Ordered key/value bag of [`PayloadValue`]s.
//! - [`PayloadSchema`] — Declares the keys and kinds a [`Payload`] must carry.

/// Tagged key/value payloads and schema validation.
pub mod payload;

pub use payload::{Payload, PayloadKind, PayloadSchema, PayloadValue};

// --- Error types ---

/// Top-level error type for the Conductor orchestrator.
///
/// Each variant corresponds to one class of failure in the taxonomy the
/// manager and engine report to callers.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// A task or agent failed validation (e.g. a requirement no agent advertises).
    #[error("Validation error: {0}")]
    Validation(String),

    /// A step was about to start while one of its prerequisites was not completed.
    #[error("Dependency not satisfied: step {step} requires step {dependency} to be completed")]
    DependencyNotSatisfied {
        /// The step that was about to run.
        step: u32,
        /// The prerequisite step that is not completed.
        dependency: u32,
    },

    /// A step exhausted its local retries.
    #[error("Step {step} failed: {error}")]
    StepFailed {
        /// Number of the failing step.
        step: u32,
        /// Last error reported by the dispatcher.
        error: String,
    },

    /// The skill dispatcher or a skill handler returned an error.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// A dispatch did not return within the configured timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A concurrency limit (engine slots or agent load) is exhausted.
    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    /// An agent, plan or task lookup failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The plan was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A recovery policy could not produce a runnable plan.
    #[error("Recovery error: {0}")]
    Recovery(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal orchestrator error.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),
}

impl ConductorError {
    /// Whether the error is worth another local attempt.
    ///
    /// Dispatch failures, timeouts and saturated agents are transient; every
    /// other class is final for the current attempt loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConductorError::Dispatch(_)
                | ConductorError::Timeout(_)
                | ConductorError::Capacity(_)
        )
    }
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;
