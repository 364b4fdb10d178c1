//! Builds an [`Orchestrator`] from a validated [`PipelineConfig`].

use std::sync::Arc;

use async_trait::async_trait;
use gdbmaint_core::config::{OperationSpec, PipelineConfig, StepConfig, StepSelection};
use gdbmaint_core::error::{ConfigurationError, StepExecutionError};
use gdbmaint_core::health::HealthScorer;
use gdbmaint_core::scripting::command::CommandOperation;
use gdbmaint_core::signals::SignalProvider;
use gdbmaint_core::step::{MaintenanceOperation, OperationStep, StepContext, StepOutput};
use gdbmaint_core::Orchestrator;
use gdbmaint_db::operations::{DisconnectUsersOperation, SqlOperation};
use gdbmaint_db::signals::{default_signal_queries, providers_from_queries};
use gdbmaint_db::DbPool;
use serde_json::json;

use crate::http::HttpCheckOperation;

/// Where operations and signals are executed.
#[derive(Clone)]
pub enum Backend {
    /// No side effects: every operation is replaced by [`DryRunOperation`].
    DryRun,
    Postgres { pool: DbPool, database: String },
}

/// Stand-in that succeeds without touching anything.
#[derive(Debug, Clone)]
pub struct DryRunOperation {
    kind: &'static str,
}

#[async_trait]
impl MaintenanceOperation for DryRunOperation {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepExecutionError> {
        tracing::info!(step = %ctx.step, kind = self.kind, "Dry run: operation not executed");
        Ok(StepOutput::detail(json!({"dry_run": true, "kind": self.kind})))
    }
}

fn build_operation(
    spec: &OperationSpec,
    backend: &Backend,
    http: &reqwest::Client,
) -> Arc<dyn MaintenanceOperation> {
    let Backend::Postgres { pool, database } = backend else {
        return Arc::new(DryRunOperation { kind: spec.kind() });
    };

    match spec {
        OperationSpec::Command {
            program,
            args,
            env,
            working_directory,
        } => Arc::new(
            CommandOperation::new(program)
                .args(args.clone())
                .env(env.clone())
                .working_directory(working_directory.clone()),
        ),
        OperationSpec::Sql { statements } => {
            Arc::new(SqlOperation::new(pool.clone(), statements.clone()))
        }
        OperationSpec::DisconnectUsers { exclude_admin } => Arc::new(
            DisconnectUsersOperation::new(pool.clone(), database, *exclude_admin),
        ),
        OperationSpec::HttpCheck {
            url,
            method,
            token_env,
        } => Arc::new(HttpCheckOperation::new(
            http.clone(),
            url,
            method,
            token_env.clone(),
        )),
    }
}

fn build_step(config: &StepConfig, backend: &Backend, http: &reqwest::Client) -> OperationStep {
    OperationStep::new(&config.name, build_operation(&config.operation, backend, http))
        .fatal(config.fatal)
        .with_retry(config.retry.clone())
        .with_timeout(config.timeout())
        .with_window(config.window)
        .depends_on(config.depends_on.clone())
        .requires_env(config.requires_env.clone())
}

fn build_providers(config: &PipelineConfig, backend: &Backend) -> Vec<Arc<dyn SignalProvider>> {
    match backend {
        Backend::DryRun => Vec::new(),
        Backend::Postgres { pool, .. } => match &config.signal_queries {
            Some(queries) => providers_from_queries(pool, queries),
            None => providers_from_queries(pool, &default_signal_queries()),
        },
    }
}

/// Assemble the orchestrator for one run.
pub fn build_orchestrator(
    config: &PipelineConfig,
    backend: &Backend,
    selection: StepSelection,
) -> Result<Orchestrator, ConfigurationError> {
    let http = reqwest::Client::new();
    let steps = config
        .steps
        .iter()
        .map(|step| build_step(step, backend, &http))
        .collect();
    let scorer = HealthScorer::new(config.scoring.clone())?;

    Orchestrator::new(steps, scorer)?
        .with_signal_providers(build_providers(config, backend))
        .with_signal_timeout(config.signal_timeout())
        .with_gate_restore(config.gate_restore.clone())?
        .with_selection(selection)
}
