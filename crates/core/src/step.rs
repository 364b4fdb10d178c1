//! Operation steps: a named maintenance operation plus its failure policy.
//!
//! [`OperationStep::execute`] never returns an error and never lets a panic
//! escape. Every failure path ends up in the returned [`StepResult`]; only
//! the orchestrator decides what happens next.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::StepExecutionError;
use crate::report::{output_preview, AttemptRecord, StepError, StepResult, StepStatus};
use crate::retry::{self, RetryPolicy};

/// Default per-attempt timeout for external operations (1 hour).
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(3600);

/// Everything an operation may know about the attempt it is running in.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: String,
    pub step: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Wall-clock budget for this attempt.
    pub timeout: Duration,
    /// Cooperative cancellation; operations may ignore it.
    pub cancel: CancellationToken,
}

/// Successful operation outcome.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Structured payload recorded as the step detail.
    pub detail: Value,
    /// Raw collaborator output, kept as a truncated preview.
    pub output: Option<String>,
}

impl StepOutput {
    pub fn detail(detail: Value) -> Self {
        Self {
            detail,
            output: None,
        }
    }
}

/// An external maintenance operation (compress, reconcile, REST call...).
#[async_trait]
pub trait MaintenanceOperation: Send + Sync {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepExecutionError>;
}

/// Whether a step runs while connections are blocked or after they are restored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepWindow {
    #[default]
    Maintenance,
    AfterRestore,
}

// ---------------------------------------------------------------------------
// OperationStep
// ---------------------------------------------------------------------------

/// A named, policy-carrying wrapper around one [`MaintenanceOperation`].
#[derive(Clone)]
pub struct OperationStep {
    name: String,
    fatal: bool,
    retry: RetryPolicy,
    timeout: Duration,
    window: StepWindow,
    depends_on: Vec<String>,
    requires_env: Vec<String>,
    operation: Arc<dyn MaintenanceOperation>,
}

impl std::fmt::Debug for OperationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationStep")
            .field("name", &self.name)
            .field("fatal", &self.fatal)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("window", &self.window)
            .field("depends_on", &self.depends_on)
            .field("requires_env", &self.requires_env)
            .finish_non_exhaustive()
    }
}

impl OperationStep {
    /// An advisory, single-attempt step with the default timeout.
    pub fn new(name: impl Into<String>, operation: Arc<dyn MaintenanceOperation>) -> Self {
        Self {
            name: name.into(),
            fatal: false,
            retry: RetryPolicy::none(),
            timeout: DEFAULT_STEP_TIMEOUT,
            window: StepWindow::Maintenance,
            depends_on: Vec::new(),
            requires_env: Vec::new(),
            operation,
        }
    }

    pub fn fatal(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_window(mut self, window: StepWindow) -> Self {
        self.window = window;
        self
    }

    pub fn depends_on(mut self, names: Vec<String>) -> Self {
        self.depends_on = names;
        self
    }

    pub fn requires_env(mut self, vars: Vec<String>) -> Self {
        self.requires_env = vars;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a failure of this step aborts the remaining steps.
    pub fn fatal_on_failure(&self) -> bool {
        self.fatal
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn window(&self) -> StepWindow {
        self.window
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    /// First required environment variable that is unset or empty.
    pub fn missing_env(&self) -> Option<&str> {
        self.requires_env
            .iter()
            .find(|var| std::env::var(var.as_str()).map_or(true, |v| v.trim().is_empty()))
            .map(String::as_str)
    }

    /// Run the operation under this step's retry policy and timeout.
    ///
    /// Retries only retryable errors, waits between attempts per the backoff,
    /// and stops retrying when `cancel` fires during a backoff wait.
    pub async fn execute(&self, run_id: &str, cancel: &CancellationToken) -> StepResult {
        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let mut attempts = Vec::new();
        let mut last_error: Option<StepExecutionError> = None;
        let mut output: Option<StepOutput> = None;

        for attempt in 1..=self.retry.max_attempts.max(1) {
            if attempt > 1 {
                let delay = self.retry.delay_before(attempt);
                tracing::info!(
                    step = %self.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying step",
                );
                if !retry::wait(delay, cancel).await {
                    tracing::warn!(step = %self.name, "Retry abandoned: run cancelled");
                    last_error = Some(StepExecutionError::Cancelled);
                    break;
                }
            }

            let ctx = StepContext {
                run_id: run_id.to_string(),
                step: self.name.clone(),
                attempt,
                timeout: self.timeout,
                cancel: cancel.clone(),
            };
            let attempt_started = chrono::Utc::now();
            let attempt_start = Instant::now();
            let outcome = self.run_guarded(&ctx).await;
            let duration_ms = attempt_start.elapsed().as_millis() as u64;

            match outcome {
                Ok(out) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at: attempt_started,
                        duration_ms,
                        error: None,
                    });
                    output = Some(out);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        step = %self.name,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Step attempt failed",
                    );
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at: attempt_started,
                        duration_ms,
                        error: Some(StepError::from(&e)),
                    });
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let finished_at = chrono::Utc::now();
        let duration_ms = start.elapsed().as_millis() as u64;

        match output {
            Some(out) => StepResult {
                name: self.name.clone(),
                status: StepStatus::Succeeded,
                started_at,
                finished_at,
                duration_ms,
                detail: out.detail,
                error: None,
                attempts,
                skip_reason: None,
                output_preview: out.output.as_deref().and_then(output_preview),
            },
            None => {
                let err = last_error.unwrap_or(StepExecutionError::Cancelled);
                StepResult {
                    name: self.name.clone(),
                    status: if self.fatal {
                        StepStatus::FailedFatal
                    } else {
                        StepStatus::FailedAdvisory
                    },
                    started_at,
                    finished_at,
                    duration_ms,
                    detail: Value::Null,
                    error: Some(StepError::from(&err)),
                    attempts,
                    skip_reason: None,
                    output_preview: None,
                }
            }
        }
    }

    /// One attempt with the timeout applied and panics contained.
    async fn run_guarded(&self, ctx: &StepContext) -> Result<StepOutput, StepExecutionError> {
        let start = Instant::now();
        let fut = AssertUnwindSafe(self.operation.run(ctx)).catch_unwind();
        match tokio::time::timeout(ctx.timeout, fut).await {
            Err(_elapsed) => Err(StepExecutionError::Timeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            }),
            Ok(Err(panic)) => Err(StepExecutionError::Panicked(panic_message(panic.as_ref()))),
            Ok(Ok(result)) => result,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    /// Fails with the given errors in order, then succeeds.
    struct Scripted {
        failures: Vec<StepExecutionError>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(failures: Vec<StepExecutionError>) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl MaintenanceOperation for Scripted {
        async fn run(&self, _ctx: &StepContext) -> Result<StepOutput, StepExecutionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.failures.get(n) {
                Some(e) => Err(e.clone()),
                None => Ok(StepOutput {
                    detail: serde_json::json!({"versions_deleted": 4}),
                    output: Some("deleted 4 versions".into()),
                }),
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl MaintenanceOperation for Panics {
        async fn run(&self, _ctx: &StepContext) -> Result<StepOutput, StepExecutionError> {
            panic!("arcpy exploded");
        }
    }

    struct Sleeps(Duration);

    #[async_trait]
    impl MaintenanceOperation for Sleeps {
        async fn run(&self, _ctx: &StepContext) -> Result<StepOutput, StepExecutionError> {
            tokio::time::sleep(self.0).await;
            Ok(StepOutput::default())
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn success_records_detail_and_preview() {
        let step = OperationStep::new("DeleteStaleVersions", Scripted::new(vec![]));
        let result = step.execute("run-1", &CancellationToken::new()).await;

        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.detail["versions_deleted"], 4);
        assert_eq!(result.output_preview.as_deref(), Some("deleted 4 versions"));
        assert_eq!(result.attempts.len(), 1);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let op = Scripted::new(vec![
            StepExecutionError::Transient("reset".into()),
            StepExecutionError::Timeout { elapsed_ms: 5 },
        ]);
        let step = OperationStep::new("ServerHealthCheck", op.clone()).with_retry(fast_retry(3));
        let result = step.execute("run-1", &CancellationToken::new()).await;

        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.attempts.len(), 3);
        assert!(result.attempts[0].error.is_some());
        assert!(result.attempts[2].error.is_none());
        assert_eq!(op.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unauthorized_is_never_retried() {
        let op = Scripted::new(vec![StepExecutionError::Unauthorized("token expired".into())]);
        let step = OperationStep::new("PortalBackup", op.clone()).with_retry(fast_retry(5));
        let result = step.execute("run-1", &CancellationToken::new()).await;

        assert_eq!(result.status, StepStatus::FailedAdvisory);
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(result.error.unwrap().kind, "unauthorized");
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_on_fatal_step_is_failed_fatal() {
        let op = Scripted::new(vec![
            StepExecutionError::Transient("lock".into()),
            StepExecutionError::Transient("lock".into()),
        ]);
        let step = OperationStep::new("ReconcilePostVersions", op)
            .fatal(true)
            .with_retry(fast_retry(2));
        let result = step.execute("run-1", &CancellationToken::new()).await;

        assert_eq!(result.status, StepStatus::FailedFatal);
        assert_eq!(result.attempts.len(), 2);
        assert!(result.detail.is_null());
    }

    #[tokio::test]
    async fn panic_is_captured_as_failure() {
        let step = OperationStep::new("RepairGeometry", Arc::new(Panics));
        let result = step.execute("run-1", &CancellationToken::new()).await;

        assert_eq!(result.status, StepStatus::FailedAdvisory);
        let err = result.error.unwrap();
        assert_eq!(err.kind, "panicked");
        assert!(err.message.contains("arcpy exploded"));
    }

    #[tokio::test]
    async fn timeout_is_a_normal_failure() {
        let step = OperationStep::new("ValidateTopology", Arc::new(Sleeps(Duration::from_secs(5))))
            .with_timeout(Duration::from_millis(20));
        let result = step.execute("run-1", &CancellationToken::new()).await;

        assert_eq!(result.status, StepStatus::FailedAdvisory);
        assert_eq!(result.error.unwrap().kind, "timeout");
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_retrying() {
        let op = Scripted::new(vec![
            StepExecutionError::Transient("busy".into()),
            StepExecutionError::Transient("busy".into()),
        ]);
        let step = OperationStep::new("CompressRebuildAnalyze", op.clone())
            .with_retry(RetryPolicy::fixed(3, Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = step.execute("run-1", &cancel).await;
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
        assert_matches!(result.error, Some(StepError { ref kind, .. }) if kind == "cancelled");
    }

    #[test]
    fn missing_env_reports_first_unset_variable() {
        let step = OperationStep::new("PortalBackup", Scripted::new(vec![])).requires_env(vec![
            "PATH".to_string(),
            "GDBMAINT_TEST_SURELY_UNSET_VAR".to_string(),
        ]);
        assert_eq!(step.missing_env(), Some("GDBMAINT_TEST_SURELY_UNSET_VAR"));
    }
}
