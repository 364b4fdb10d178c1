use std::process::ExitCode;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gdbmaint_core::config::PipelineConfig;
use gdbmaint_core::error::ConfigurationError;
use gdbmaint_core::gate::InMemoryGate;
use gdbmaint_core::report::RunReport;
use gdbmaint_db::PgConnectionGate;
use gdbmaint_worker::registry::{build_orchestrator, Backend};
use gdbmaint_worker::report::{emit_all, JsonFileSink, ReportSink, SummarySink};
use gdbmaint_worker::settings::{LogFormat, WorkerSettings};
use gdbmaint_worker::{exit_code, EXIT_CONFIGURATION, EXIT_FAILED};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing(LogFormat::from_env());

    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) if e.downcast_ref::<ConfigurationError>().is_some() => {
            tracing::error!(error = %e, "Invalid configuration, nothing was changed");
            ExitCode::from(EXIT_CONFIGURATION)
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Maintenance run could not start");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "gdbmaint_worker=info,gdbmaint_core=info,gdbmaint_db=info".into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn run() -> anyhow::Result<u8> {
    // --- Configuration ---
    let settings = WorkerSettings::from_env(std::env::args().nth(1))?;
    let text = std::fs::read_to_string(&settings.config_path).map_err(|e| {
        ConfigurationError::Parse(format!(
            "cannot read {}: {e}",
            settings.config_path.display()
        ))
    })?;
    let config = PipelineConfig::from_json(&text)?;
    settings
        .selection
        .validate(config.steps.iter().map(|s| s.name.as_str()))?;
    tracing::info!(
        config = %settings.config_path.display(),
        steps = config.steps.len(),
        dry_run = settings.dry_run,
        "Loaded maintenance configuration",
    );

    // --- Cancellation ---
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing current step and restoring connections");
            on_signal.cancel();
        }
    });

    // --- Run ---
    let report = if settings.dry_run {
        let orchestrator = build_orchestrator(&config, &Backend::DryRun, settings.selection.clone())?;
        let mut gate = InMemoryGate::new();
        orchestrator.run(&mut gate, &cancel).await
    } else {
        run_against_database(&settings, &config, &cancel).await?
    };

    // --- Reports ---
    let mut sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(SummarySink)];
    if let Some(dir) = &settings.report_dir {
        sinks.push(Box::new(JsonFileSink::new(dir)));
    }
    emit_all(&sinks, &report).await;

    Ok(exit_code(&report))
}

async fn run_against_database(
    settings: &WorkerSettings,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<RunReport> {
    let database_url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;
    let database = settings
        .database
        .clone()
        .context("target database is not configured")?;

    let pool = gdbmaint_db::create_pool(database_url)
        .await
        .context("Failed to connect to database")?;
    gdbmaint_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!(database = %database, "Database connection pool created");

    let backend = Backend::Postgres {
        pool: pool.clone(),
        database: database.clone(),
    };
    let orchestrator = build_orchestrator(config, &backend, settings.selection.clone())?;
    let mut gate = PgConnectionGate::new(pool, database)?;
    Ok(orchestrator.run(&mut gate, cancel).await)
}
