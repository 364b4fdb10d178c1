//! Maintenance run state machine.
//!
//! Phases are visited in the order
//! `Idle → Gating → Executing(i) → Restoring → FollowUp(j) → Scoring → Done`.
//! Every exit from the execution phase goes through `Restoring`; the only
//! path that skips it is a failed `block()`, where nothing was gated.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{validate_pipeline, StepSelection};
use crate::error::ConfigurationError;
use crate::gate::ConnectionGate;
use crate::health::{HealthScore, HealthScorer, SignalSet};
use crate::report::{
    derive_overall_status, RunFlags, RunPhase, RunReport, StepResult, StepStatus,
};
use crate::retry::RetryPolicy;
use crate::signals::{collect_signals, signals_from_detail, SignalProvider, DEFAULT_SIGNAL_TIMEOUT};
use crate::step::{OperationStep, StepWindow};
use crate::types::{new_run_id, Timestamp};

/// Composes a connection gate, an ordered step list and a health scorer
/// into one run.
pub struct Orchestrator {
    steps: Vec<OperationStep>,
    scorer: HealthScorer,
    providers: Vec<Arc<dyn SignalProvider>>,
    gate_restore: RetryPolicy,
    selection: StepSelection,
    signal_timeout: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("steps", &self.steps)
            .field("scorer", &self.scorer)
            .field("providers", &self.providers.len())
            .field("gate_restore", &self.gate_restore)
            .field("selection", &self.selection)
            .field("signal_timeout", &self.signal_timeout)
            .finish()
    }
}

/// Mutable bookkeeping for one run.
struct RunState {
    run_id: String,
    phases: Vec<RunPhase>,
    results: Vec<StepResult>,
    block_failed: bool,
    gate_restored: Option<bool>,
    gate_restore_attempts: u32,
    gate_error: Option<String>,
    cancelled: bool,
    /// Set when the maintenance window ended early; follow-ups are skipped.
    window_abort: Option<String>,
    signals: SignalSet,
    health: Option<HealthScore>,
    scoring_error: Option<String>,
}

impl Orchestrator {
    /// Validate the step list and build an orchestrator.
    ///
    /// Fails on empty or duplicate names, dependencies that are not declared
    /// earlier, maintenance steps after post-restore steps, and invalid
    /// retry policies or timeouts.
    pub fn new(steps: Vec<OperationStep>, scorer: HealthScorer) -> Result<Self, ConfigurationError> {
        validate_pipeline(
            steps
                .iter()
                .map(|s| (s.name(), s.window(), s.dependencies())),
        )?;
        for step in &steps {
            step.retry_policy()
                .validate()
                .map_err(|reason| ConfigurationError::InvalidRetryPolicy {
                    step: step.name().to_string(),
                    reason,
                })?;
            if step.timeout().is_zero() {
                return Err(ConfigurationError::Validation(format!(
                    "Step '{}': timeout must be greater than 0",
                    step.name()
                )));
            }
        }

        Ok(Self {
            steps,
            scorer,
            providers: Vec::new(),
            gate_restore: RetryPolicy::gate_restore_default(),
            selection: StepSelection::all(),
            signal_timeout: DEFAULT_SIGNAL_TIMEOUT,
        })
    }

    pub fn with_signal_providers(mut self, providers: Vec<Arc<dyn SignalProvider>>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_signal_timeout(mut self, timeout: Duration) -> Self {
        self.signal_timeout = timeout;
        self
    }

    /// Override the policy used to retry `allow()`.
    pub fn with_gate_restore(mut self, policy: RetryPolicy) -> Result<Self, ConfigurationError> {
        policy
            .validate()
            .map_err(|reason| ConfigurationError::InvalidRetryPolicy {
                step: "gate_restore".to_string(),
                reason,
            })?;
        self.gate_restore = policy;
        Ok(self)
    }

    /// Restrict the run to a subset of steps. Unknown names are rejected.
    pub fn with_selection(mut self, selection: StepSelection) -> Result<Self, ConfigurationError> {
        selection.validate(self.steps.iter().map(|s| s.name()))?;
        self.selection = selection;
        Ok(self)
    }

    pub fn steps(&self) -> &[OperationStep] {
        &self.steps
    }

    /// Execute one maintenance run.
    ///
    /// Never fails: every outcome, including gate failures, is recorded in
    /// the returned report.
    pub async fn run<G>(&self, gate: &mut G, cancel: &CancellationToken) -> RunReport
    where
        G: ConnectionGate + ?Sized,
    {
        let started_at = chrono::Utc::now();
        let mut run = RunState {
            run_id: new_run_id(started_at),
            phases: Vec::new(),
            results: Vec::with_capacity(self.steps.len()),
            block_failed: false,
            gate_restored: None,
            gate_restore_attempts: 0,
            gate_error: None,
            cancelled: false,
            window_abort: None,
            signals: SignalSet::new(),
            health: None,
            scoring_error: None,
        };
        tracing::info!(
            run_id = %run.run_id,
            steps = self.steps.len(),
            gate = %gate.current_state(),
            "Maintenance run starting",
        );

        let mut phase = RunPhase::Idle;
        loop {
            run.phases.push(phase.clone());
            phase = match phase {
                RunPhase::Idle => RunPhase::Gating,
                RunPhase::Gating => self.gate(gate, &mut run).await,
                RunPhase::Executing { index, .. } => {
                    self.step(index, StepWindow::Maintenance, &mut run, cancel)
                        .await
                }
                RunPhase::Restoring => self.restore(gate, &mut run).await,
                RunPhase::FollowUp { index, .. } => {
                    self.step(index, StepWindow::AfterRestore, &mut run, cancel)
                        .await
                }
                RunPhase::Scoring => self.score(&mut run).await,
                RunPhase::Done => break,
            };
        }

        self.finish(run, started_at)
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    async fn gate<G>(&self, gate: &mut G, run: &mut RunState) -> RunPhase
    where
        G: ConnectionGate + ?Sized,
    {
        match gate.block().await {
            Ok(()) => {
                tracing::info!(run_id = %run.run_id, "New connections blocked");
                self.phase_at(0, StepWindow::Maintenance)
            }
            Err(e) => {
                tracing::error!(
                    run_id = %run.run_id,
                    error = %e,
                    "Could not block new connections, no steps will run",
                );
                run.block_failed = true;
                run.gate_error = Some(e.to_string());
                RunPhase::Done
            }
        }
    }

    /// Run (or skip) the step at `index` and pick the next phase.
    async fn step(
        &self,
        index: usize,
        window: StepWindow,
        run: &mut RunState,
        cancel: &CancellationToken,
    ) -> RunPhase {
        let step = &self.steps[index];
        let result = match self.skip_reason(step, run, cancel) {
            Some(reason) => {
                tracing::info!(run_id = %run.run_id, step = step.name(), reason = %reason, "Step skipped");
                StepResult::skipped(step.name(), reason)
            }
            None => {
                tracing::info!(
                    run_id = %run.run_id,
                    step = step.name(),
                    fatal = step.fatal_on_failure(),
                    "Executing step",
                );
                let result = step.execute(&run.run_id, cancel).await;
                tracing::info!(
                    run_id = %run.run_id,
                    step = step.name(),
                    status = result.status.as_str(),
                    duration_ms = result.duration_ms,
                    attempts = result.attempts.len(),
                    "Step finished",
                );
                result
            }
        };

        let fatal = result.status == StepStatus::FailedFatal;
        run.results.push(result);

        let abort = if fatal {
            tracing::error!(
                run_id = %run.run_id,
                step = step.name(),
                "Fatal step failed, skipping remaining steps",
            );
            Some(format!("aborted after fatal failure of {}", step.name()))
        } else if cancel.is_cancelled() {
            if !run.cancelled {
                tracing::warn!(run_id = %run.run_id, step = step.name(), "Run cancelled");
            }
            run.cancelled = true;
            Some("cancelled".to_string())
        } else {
            None
        };

        match abort {
            Some(reason) => {
                self.skip_remaining(index + 1, window, &reason, run);
                if window == StepWindow::Maintenance {
                    run.window_abort = Some(reason);
                }
                Self::after_window(window)
            }
            None => self.phase_at(index + 1, window),
        }
    }

    /// Restore the gate, retrying per the gate-restore policy.
    ///
    /// Backoff here ignores cancellation: a cancelled run still owes a
    /// restored gate.
    async fn restore<G>(&self, gate: &mut G, run: &mut RunState) -> RunPhase
    where
        G: ConnectionGate + ?Sized,
    {
        let max_attempts = self.gate_restore.max_attempts.max(1);
        let mut restored = false;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.gate_restore.delay_before(attempt);
                tracing::info!(
                    run_id = %run.run_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying gate restore",
                );
                tokio::time::sleep(delay).await;
            }
            run.gate_restore_attempts = attempt;
            match gate.allow().await {
                Ok(()) => {
                    restored = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        run_id = %run.run_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Gate restore attempt failed",
                    );
                    run.gate_error = Some(e.to_string());
                }
            }
        }

        run.gate_restored = Some(restored);
        if restored {
            tracing::info!(
                run_id = %run.run_id,
                attempts = run.gate_restore_attempts,
                "New connections allowed again",
            );
        } else {
            tracing::error!(
                run_id = %run.run_id,
                attempts = run.gate_restore_attempts,
                error = run.gate_error.as_deref().unwrap_or_default(),
                "Gate restore FAILED: database is still refusing new connections",
            );
        }

        let first_follow_up = self
            .steps
            .iter()
            .position(|s| s.window() == StepWindow::AfterRestore);
        match first_follow_up {
            Some(index) if run.window_abort.is_some() => {
                let reason = if run.cancelled {
                    "cancelled"
                } else {
                    "maintenance window aborted"
                };
                self.skip_remaining(index, StepWindow::AfterRestore, reason, run);
                RunPhase::Scoring
            }
            Some(index) => self.phase_at(index, StepWindow::AfterRestore),
            None => RunPhase::Scoring,
        }
    }

    async fn score(&self, run: &mut RunState) -> RunPhase {
        let mut published = SignalSet::new();
        for result in run.results.iter().filter(|r| r.succeeded()) {
            for (name, value) in signals_from_detail(&result.detail) {
                published.record(name, value);
            }
        }

        let signals = collect_signals(&self.providers, published, self.signal_timeout).await;
        match self.scorer.score(&signals) {
            Ok(health) => {
                tracing::info!(
                    run_id = %run.run_id,
                    score = health.score,
                    grade = health.grade.as_str(),
                    excluded = health.excluded.len(),
                    "Health score computed",
                );
                run.health = Some(health);
            }
            Err(e) => {
                tracing::warn!(run_id = %run.run_id, error = %e, "Health scoring failed");
                run.scoring_error = Some(e.to_string());
            }
        }
        run.signals = signals;
        RunPhase::Done
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Why the step must not run, checked in order: cancellation, operator
    /// selection, unmet dependencies, missing configuration.
    fn skip_reason(
        &self,
        step: &OperationStep,
        run: &RunState,
        cancel: &CancellationToken,
    ) -> Option<String> {
        if cancel.is_cancelled() {
            return Some("cancelled".to_string());
        }
        if let Some(reason) = self.selection.skip_reason(step.name()) {
            return Some(reason.to_string());
        }
        for dep in step.dependencies() {
            let ok = run
                .results
                .iter()
                .any(|r| &r.name == dep && r.succeeded());
            if !ok {
                return Some(format!("dependency {dep} did not succeed"));
            }
        }
        step.missing_env()
            .map(|var| format!("missing configuration: {var}"))
    }

    /// Record every remaining step of `window`, from `from`, as skipped.
    fn skip_remaining(&self, from: usize, window: StepWindow, reason: &str, run: &mut RunState) {
        for step in self
            .steps
            .iter()
            .skip(from)
            .take_while(|s| s.window() == window)
        {
            run.results.push(StepResult::skipped(step.name(), reason));
        }
    }

    /// The phase for the step at `index` if it belongs to `window`,
    /// otherwise the phase that closes the window.
    fn phase_at(&self, index: usize, window: StepWindow) -> RunPhase {
        match self.steps.get(index) {
            Some(step) if step.window() == window => {
                let name = step.name().to_string();
                match window {
                    StepWindow::Maintenance => RunPhase::Executing { index, step: name },
                    StepWindow::AfterRestore => RunPhase::FollowUp { index, step: name },
                }
            }
            _ => Self::after_window(window),
        }
    }

    fn after_window(window: StepWindow) -> RunPhase {
        match window {
            StepWindow::Maintenance => RunPhase::Restoring,
            StepWindow::AfterRestore => RunPhase::Scoring,
        }
    }

    fn finish(&self, run: RunState, started_at: Timestamp) -> RunReport {
        let flags = RunFlags {
            block_failed: run.block_failed,
            gate_restored: run.gate_restored,
            scoring_failed: run.scoring_error.is_some(),
            cancelled: run.cancelled,
        };
        let overall_status = derive_overall_status(&run.results, flags);

        let report = RunReport {
            run_id: run.run_id,
            started_at,
            finished_at: chrono::Utc::now(),
            overall_status,
            gate_restored: run.gate_restored,
            gate_restore_attempts: run.gate_restore_attempts,
            gate_error: run.gate_error,
            cancelled: run.cancelled,
            steps: run.results,
            signals: run.signals,
            health: run.health,
            scoring_error: run.scoring_error,
            phases: run.phases,
        };

        if report.gate_left_blocked() {
            tracing::error!(
                run_id = %report.run_id,
                status = report.overall_status.as_str(),
                "Maintenance run finished with the gate still blocked",
            );
        } else {
            tracing::info!(
                run_id = %report.run_id,
                status = report.overall_status.as_str(),
                duration_ms = report.duration_ms(),
                "Maintenance run finished",
            );
        }
        report
    }
}
