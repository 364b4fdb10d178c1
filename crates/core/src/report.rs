//! Step and run outcome records.
//!
//! A [`StepResult`] is produced once per configured step and never modified
//! afterwards; the orchestrator assembles them into a [`RunReport`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StepExecutionError;
use crate::health::{HealthScore, SignalSet};
use crate::types::Timestamp;

/// Maximum characters of collaborator output kept in a step result.
pub const OUTPUT_PREVIEW_CHARS: usize = 500;

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

/// Final status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    FailedAdvisory,
    FailedFatal,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::FailedAdvisory => "failed_advisory",
            Self::FailedFatal => "failed_fatal",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::FailedAdvisory | Self::FailedFatal)
    }

    /// Marker used in the human-readable summary.
    fn marker(&self) -> char {
        match self {
            Self::Succeeded => '+',
            Self::FailedAdvisory | Self::FailedFatal => '-',
            Self::Skipped => 'o',
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Serializable form of a [`StepExecutionError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&StepExecutionError> for StepError {
    fn from(err: &StepExecutionError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// One attempt at running a step's operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub started_at: Timestamp,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

/// Outcome of one configured step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub duration_ms: u64,
    /// Structured payload from the operation (counts repaired, versions deleted...).
    pub detail: Value,
    /// Present iff `status` is a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub attempts: Vec<AttemptRecord>,
    /// Present iff `status` is `Skipped`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
}

impl StepResult {
    /// A step that was never attempted.
    pub fn skipped(name: &str, reason: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            name: name.to_string(),
            status: StepStatus::Skipped,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            detail: Value::Null,
            error: None,
            attempts: Vec::new(),
            skip_reason: Some(reason.into()),
            output_preview: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Truncate collaborator output to [`OUTPUT_PREVIEW_CHARS`] characters.
pub fn output_preview(output: &str) -> Option<String> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(OUTPUT_PREVIEW_CHARS).collect())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Orchestrator state-machine phases, in the order they may be visited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Gating,
    Executing { index: usize, step: String },
    Restoring,
    FollowUp { index: usize, step: String },
    Scoring,
    Done,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Succeeded,
    Degraded,
    Failed,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to [`derive_overall_status`] beyond the step results.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    pub block_failed: bool,
    /// `None` when the gate was never blocked.
    pub gate_restored: Option<bool>,
    pub scoring_failed: bool,
    pub cancelled: bool,
}

/// Failed on any fatal step or gate failure; Degraded on advisory failures,
/// scoring failure or cancellation; Succeeded otherwise.
pub fn derive_overall_status(steps: &[StepResult], flags: RunFlags) -> OverallStatus {
    let fatal = steps.iter().any(|s| s.status == StepStatus::FailedFatal);
    if fatal || flags.block_failed || flags.gate_restored == Some(false) {
        return OverallStatus::Failed;
    }
    let advisory = steps.iter().any(|s| s.status == StepStatus::FailedAdvisory);
    if advisory || flags.scoring_failed || flags.cancelled {
        return OverallStatus::Degraded;
    }
    OverallStatus::Succeeded
}

/// Everything known about one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub overall_status: OverallStatus,
    /// Omitted when the gate was never blocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_restored: Option<bool>,
    pub gate_restore_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_error: Option<String>,
    pub cancelled: bool,
    pub steps: Vec<StepResult>,
    pub signals: SignalSet,
    pub health: Option<HealthScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scoring_error: Option<String>,
    pub phases: Vec<RunPhase>,
}

impl RunReport {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Whether the gate was left blocked after the run.
    pub fn gate_left_blocked(&self) -> bool {
        self.gate_restored == Some(false)
    }

    /// Human-readable summary.
    pub fn summary(&self) -> String {
        let rule = "=".repeat(60);
        let mut lines = vec![
            String::new(),
            rule.clone(),
            "MAINTENANCE SUMMARY".to_string(),
            rule,
            format!("Run: {}", self.run_id),
            format!("Start: {}", self.started_at.format("%Y-%m-%d %H:%M:%S")),
            format!("End: {}", self.finished_at.format("%Y-%m-%d %H:%M:%S")),
            format!("Overall Status: {}", self.overall_status.as_str().to_uppercase()),
        ];

        match self.gate_restored {
            Some(true) => lines.push("Connections: restored".to_string()),
            Some(false) => lines.push(format!(
                "Connections: STILL BLOCKED after {} attempt(s)",
                self.gate_restore_attempts
            )),
            None => lines.push("Connections: never blocked".to_string()),
        }
        if self.cancelled {
            lines.push("Run was cancelled".to_string());
        }

        match (&self.health, &self.scoring_error) {
            (Some(h), _) => lines.push(format!(
                "Health Score: {}/100 ({})",
                h.score,
                h.grade.as_str().to_uppercase()
            )),
            (None, Some(e)) => lines.push(format!("Health Score: unavailable ({e})")),
            (None, None) => lines.push("Health Score: not computed".to_string()),
        }

        lines.push(String::new());
        lines.push("Steps:".to_string());
        for step in &self.steps {
            let mut line = format!("  [{}] {}", step.status.marker(), step.name);
            if step.duration_ms > 0 {
                line.push_str(&format!(" ({:.1}s)", step.duration_ms as f64 / 1000.0));
            }
            if step.attempts.len() > 1 {
                line.push_str(&format!(" after {} attempts", step.attempts.len()));
            }
            if let Some(reason) = &step.skip_reason {
                line.push_str(&format!(" - {reason}"));
            }
            if let Some(err) = &step.error {
                line.push_str(&format!(" - {}", err.message));
            }
            lines.push(line);
        }

        lines.join("\n")
    }
}
