//! Run report output.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gdbmaint_core::report::RunReport;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write report to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Destination for a finished run report.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn emit(&self, report: &RunReport) -> Result<(), ReportError>;
}

/// Writes `<dir>/<YYYY-MM-DD_HHMMSS>_maintenance_report.json`.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, report: &RunReport) -> PathBuf {
        self.dir.join(format!(
            "{}_maintenance_report.json",
            report.started_at.format("%Y-%m-%d_%H%M%S")
        ))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ReportError + '_ {
    move |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl ReportSink for JsonFileSink {
    async fn emit(&self, report: &RunReport) -> Result<(), ReportError> {
        let json = serde_json::to_vec_pretty(report)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;

        let path = self.path_for(report);
        tokio::fs::write(&path, json).await.map_err(io_error(&path))?;
        tracing::info!(path = %path.display(), "Report saved");
        Ok(())
    }
}

/// Prints the human-readable summary to stdout.
pub struct SummarySink;

#[async_trait]
impl ReportSink for SummarySink {
    async fn emit(&self, report: &RunReport) -> Result<(), ReportError> {
        println!("{}", report.summary());
        Ok(())
    }
}

/// Emit to every sink; a failing sink is logged and does not stop the rest.
pub async fn emit_all(sinks: &[Box<dyn ReportSink>], report: &RunReport) -> usize {
    let mut failures = 0;
    for sink in sinks {
        if let Err(e) = sink.emit(report).await {
            tracing::error!(run_id = %report.run_id, error = %e, "Failed to emit report");
            failures += 1;
        }
    }
    failures
}
