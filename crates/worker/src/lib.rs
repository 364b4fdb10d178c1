//! Maintenance worker: wires configuration, PostgreSQL and report sinks
//! around the orchestrator.

pub mod http;
pub mod registry;
pub mod report;
pub mod settings;

use gdbmaint_core::report::{OverallStatus, RunReport};

pub const EXIT_SUCCEEDED: u8 = 0;
pub const EXIT_DEGRADED: u8 = 1;
pub const EXIT_FAILED: u8 = 2;
/// Failed and the database still refuses new connections.
pub const EXIT_GATE_BLOCKED: u8 = 3;
/// Rejected before any side effect.
pub const EXIT_CONFIGURATION: u8 = 4;

/// Process exit code for a finished run.
pub fn exit_code(report: &RunReport) -> u8 {
    if report.gate_left_blocked() {
        return EXIT_GATE_BLOCKED;
    }
    match report.overall_status {
        OverallStatus::Succeeded => EXIT_SUCCEEDED,
        OverallStatus::Degraded => EXIT_DEGRADED,
        OverallStatus::Failed => EXIT_FAILED,
    }
}
