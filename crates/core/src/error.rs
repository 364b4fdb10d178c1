//! Error taxonomy for maintenance runs.
//!
//! Only [`ConfigurationError`] ever escapes to the caller as an `Err`; the
//! other kinds are captured into the run report by the orchestrator.

/// Invalid pipeline, threshold, or selection configuration.
///
/// Always detected before the gate is touched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Configuration could not be parsed: {0}")]
    Parse(String),

    #[error("Step at position {index} has an empty name")]
    EmptyStepName { index: usize },

    #[error("Duplicate step name: '{0}'")]
    DuplicateStepName(String),

    #[error("Invalid step ordering: '{step}' depends on '{dependency}', which is not declared before it")]
    InvalidOrdering { step: String, dependency: String },

    #[error("Invalid step ordering: '{step}' runs inside the maintenance window but is declared after a post-restore step")]
    WindowOrdering { step: String },

    #[error("Invalid retry policy for '{step}': {reason}")]
    InvalidRetryPolicy { step: String, reason: String },

    #[error("Invalid threshold for signal '{signal}': {reason}")]
    InvalidThreshold { signal: String, reason: String },

    #[error("Invalid grade cutoffs: {0}")]
    InvalidGradeCutoffs(String),

    #[error("Unknown step name in selection: '{0}'")]
    UnknownStep(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Failure of the connection gate itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("Failed to block new connections: {0}")]
    Block(String),

    #[error("Failed to allow new connections: {0}")]
    Allow(String),
}

/// Failure reported by an external collaborator during a step attempt.
///
/// The variant decides retryability: only [`Timeout`](Self::Timeout) and
/// [`Transient`](Self::Transient) are ever retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepExecutionError {
    #[error("Operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("Cancelled before completion")]
    Cancelled,

    #[error("Operation panicked: {0}")]
    Panicked(String),
}

impl StepExecutionError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transient(_))
    }

    /// Stable machine-readable kind used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Unauthorized(_) => "unauthorized",
            Self::Transient(_) => "transient",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// Signal collection or score computation failure. Never fails a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoringError {
    #[error("No scored signal was available ({excluded} excluded)")]
    NoSignals { excluded: usize },

    #[error("Signal '{signal}' could not be collected: {message}")]
    Provider { signal: String, message: String },
}
