/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Build a unique run identifier from the start time plus a v7 UUID suffix.
///
/// Format: `run-20261019T021500Z-<uuid>`.
pub fn new_run_id(started_at: Timestamp) -> String {
    format!(
        "run-{}-{}",
        started_at.format("%Y%m%dT%H%M%SZ"),
        uuid::Uuid::now_v7().simple()
    )
}
