//! End-to-end dry runs: configuration → orchestrator → report sinks.
//!
//! Uses the in-memory gate and dry-run operations; no database is needed.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use gdbmaint_core::config::{PipelineConfig, StepSelection};
use gdbmaint_core::gate::{ConnectionGate, GateState, InMemoryGate};
use gdbmaint_core::report::{OverallStatus, RunReport, StepStatus};
use gdbmaint_worker::registry::{build_orchestrator, Backend};
use gdbmaint_worker::report::{emit_all, JsonFileSink, ReportSink};
use gdbmaint_worker::{
    exit_code, EXIT_DEGRADED, EXIT_FAILED, EXIT_GATE_BLOCKED, EXIT_SUCCEEDED,
};

const NIGHTLY: &str = r#"{
    "steps": [
        {"name": "DisconnectUsers", "fatal": true, "operation": {"kind": "disconnect_users"}},
        {"name": "ReconcilePostVersions", "fatal": true, "depends_on": ["DisconnectUsers"],
         "operation": {"kind": "command", "program": "python3", "args": ["scripts/reconcile_post.py"]}},
        {"name": "DeleteStaleVersions", "depends_on": ["ReconcilePostVersions"],
         "operation": {"kind": "sql", "statements": ["SELECT 1"]}},
        {"name": "CompressRebuildAnalyze", "fatal": true,
         "operation": {"kind": "sql", "statements": ["VACUUM ANALYZE"]}},
        {"name": "ServerHealthCheck", "window": "after_restore",
         "retry": {"max_attempts": 3, "backoff": {"kind": "fixed", "delay_ms": 10}},
         "operation": {"kind": "http_check", "url": "https://gis.example.com/arcgis/admin/health"}},
        {"name": "PortalBackup", "window": "after_restore",
         "requires_env": ["GDBMAINT_IT_PORTAL_TOKEN_NEVER_SET"],
         "operation": {"kind": "http_check", "url": "https://gis.example.com/portal/backup",
                       "method": "POST", "token_env": "GDBMAINT_IT_PORTAL_TOKEN_NEVER_SET"}}
    ],
    "gate_restore": {"max_attempts": 2, "backoff": {"kind": "fixed", "delay_ms": 1}}
}"#;

async fn dry_run(selection: StepSelection, gate: &mut InMemoryGate) -> RunReport {
    let config = PipelineConfig::from_json(NIGHTLY).expect("valid config");
    let orchestrator =
        build_orchestrator(&config, &Backend::DryRun, selection).expect("valid orchestrator");
    orchestrator.run(gate, &CancellationToken::new()).await
}

#[tokio::test]
async fn dry_run_exercises_every_rule_without_side_effects() {
    let mut gate = InMemoryGate::new();
    let report = dry_run(StepSelection::all(), &mut gate).await;

    let statuses: Vec<StepStatus> = report.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Succeeded,
            StepStatus::Succeeded,
            StepStatus::Succeeded,
            StepStatus::Succeeded,
            StepStatus::Succeeded,
            StepStatus::Skipped,
        ]
    );
    let compress = report.step("CompressRebuildAnalyze").expect("step recorded");
    assert_eq!(compress.detail["dry_run"], true);
    assert_eq!(compress.detail["kind"], "sql");
    assert_eq!(
        report.step("PortalBackup").and_then(|s| s.skip_reason.as_deref()),
        Some("missing configuration: GDBMAINT_IT_PORTAL_TOKEN_NEVER_SET")
    );

    // No providers and no published signals: no score.
    assert!(report.health.is_none());
    assert_eq!(report.overall_status, OverallStatus::Degraded);
    assert_eq!(exit_code(&report), EXIT_DEGRADED);
    assert_eq!(gate.current_state(), GateState::Open);
}

#[tokio::test]
async fn skipped_dependency_cascades() {
    let mut gate = InMemoryGate::new();
    let report = dry_run(
        StepSelection::from_lists(None, Some("ReconcilePostVersions")),
        &mut gate,
    )
    .await;

    assert_eq!(
        report
            .step("ReconcilePostVersions")
            .and_then(|s| s.skip_reason.as_deref()),
        Some("skipped by operator")
    );
    assert_eq!(
        report
            .step("DeleteStaleVersions")
            .and_then(|s| s.skip_reason.as_deref()),
        Some("dependency ReconcilePostVersions did not succeed")
    );
    assert_eq!(
        report.step("CompressRebuildAnalyze").map(|s| s.status),
        Some(StepStatus::Succeeded)
    );
}

#[tokio::test]
async fn exit_codes_follow_gate_and_status() {
    let mut blocked = InMemoryGate::failing_block();
    let report = dry_run(StepSelection::all(), &mut blocked).await;
    assert_eq!(exit_code(&report), EXIT_FAILED);

    let mut stuck = InMemoryGate::failing_allow(5);
    let report = dry_run(StepSelection::all(), &mut stuck).await;
    assert_eq!(report.gate_restore_attempts, 2);
    assert_eq!(exit_code(&report), EXIT_GATE_BLOCKED);

    let mut report = dry_run(StepSelection::all(), &mut InMemoryGate::new()).await;
    report.overall_status = OverallStatus::Succeeded;
    report.scoring_error = None;
    assert_eq!(exit_code(&report), EXIT_SUCCEEDED);
}

#[tokio::test]
async fn json_report_is_written_to_report_dir() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let dir = tmp.path().join("reports").join("nightly");
    let report = dry_run(StepSelection::all(), &mut InMemoryGate::new()).await;

    let sink = JsonFileSink::new(&dir);
    let expected = sink.path_for(&report);
    let sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(sink)];
    assert_eq!(emit_all(&sinks, &report).await, 0);

    assert!(expected
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with("_maintenance_report.json")));
    let text = std::fs::read_to_string(&expected).expect("report file exists");
    let json: serde_json::Value = serde_json::from_str(&text).expect("valid JSON");
    assert_eq!(json["run_id"], report.run_id.as_str());
    assert_eq!(json["overall_status"], "degraded");
    assert_eq!(json["gate_restored"], true);
    assert_eq!(json["steps"].as_array().map(Vec::len), Some(6));
    assert!(json["health"].is_null());
}

#[tokio::test]
async fn unwritable_report_dir_is_counted_not_fatal() {
    let tmp = tempfile::NamedTempFile::new().expect("create temp file");
    // A regular file cannot be used as a directory.
    let sink = JsonFileSink::new(tmp.path().join("reports"));
    let report = dry_run(StepSelection::all(), &mut InMemoryGate::new()).await;

    let sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(sink)];
    assert_eq!(emit_all(&sinks, &report).await, 1);
}

#[test]
fn shipped_example_config_is_valid() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../config/maintenance.example.json");
    let text = std::fs::read_to_string(&path).expect("example config exists");
    let config = PipelineConfig::from_json(&text).expect("example config is valid");
    assert!(config.steps.iter().any(|s| s.name == "DisconnectUsers" && s.fatal));
    assert!(build_orchestrator(&config, &Backend::DryRun, StepSelection::all()).is_ok());
}
