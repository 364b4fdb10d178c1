//! Geodatabase maintenance orchestration.
//!
//! This crate holds everything that does not need a database driver:
//!
//! - [`Orchestrator`]: the run state machine that gates connections, runs
//!   the ordered steps, always restores the gate and scores health.
//! - [`ConnectionGate`]: block/allow capability over new connections.
//! - [`OperationStep`] and [`MaintenanceOperation`]: named operations with
//!   retry, timeout and fatal/advisory policy.
//! - [`HealthScorer`]: pure threshold-based health scoring.
//! - [`RunReport`]: the per-run outcome record.
//! - [`scripting`]: external-program operations.

pub mod config;
pub mod error;
pub mod gate;
pub mod health;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod scripting;
pub mod signals;
pub mod step;
pub mod types;

pub use config::{OperationSpec, PipelineConfig, SignalQuery, StepConfig, StepSelection};
pub use error::{ConfigurationError, GateError, ScoringError, StepExecutionError};
pub use gate::{ConnectionGate, GateState, InMemoryGate};
pub use health::{Grade, HealthScore, HealthScorer, ScoringConfig, SignalSet, SignalValue};
pub use orchestrator::Orchestrator;
pub use report::{OverallStatus, RunReport, StepResult, StepStatus};
pub use retry::RetryPolicy;
pub use signals::SignalProvider;
pub use step::{MaintenanceOperation, OperationStep, StepContext, StepOutput, StepWindow};
