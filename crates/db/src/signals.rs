//! Health signal providers backed by SQL queries.

use std::sync::Arc;

use async_trait::async_trait;
use gdbmaint_core::config::SignalQuery;
use gdbmaint_core::error::ScoringError;
use gdbmaint_core::health::{
    SignalValue, SIGNAL_ACTIVE_CONNECTIONS, SIGNAL_DAYS_SINCE_LAST_COMPRESS,
    SIGNAL_DELTA_TABLE_ROWS, SIGNAL_STALE_VERSIONS, SIGNAL_STATE_COUNT,
};
use gdbmaint_core::signals::SignalProvider;

use crate::DbPool;

/// Reads one numeric signal with a single-value query.
///
/// The query is wrapped as a scalar subquery, so it must return at most one
/// row with one column. No row or a NULL value means "no value".
pub struct PgSignalProvider {
    pool: DbPool,
    signal: String,
    query: String,
}

impl PgSignalProvider {
    pub fn new(pool: DbPool, signal: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            pool,
            signal: signal.into(),
            query: query.into(),
        }
    }
}

fn scalar_sql(query: &str) -> String {
    format!(
        "SELECT ({})::double precision",
        query.trim().trim_end_matches(';')
    )
}

#[async_trait]
impl SignalProvider for PgSignalProvider {
    fn signal(&self) -> &str {
        &self.signal
    }

    async fn read(&self) -> Result<Option<SignalValue>, ScoringError> {
        let value: Option<f64> = sqlx::query_scalar(&scalar_sql(&self.query))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ScoringError::Provider {
                signal: self.signal.clone(),
                message: e.to_string(),
            })?;
        Ok(value.map(SignalValue::Number))
    }
}

/// Build one provider per configured query.
pub fn providers_from_queries(pool: &DbPool, queries: &[SignalQuery]) -> Vec<Arc<dyn SignalProvider>> {
    queries
        .iter()
        .map(|q| {
            Arc::new(PgSignalProvider::new(pool.clone(), &q.signal, &q.query))
                as Arc<dyn SignalProvider>
        })
        .collect()
}

/// Queries for the built-in signals against the `sde` schema and the
/// PostgreSQL statistics views.
pub fn default_signal_queries() -> Vec<SignalQuery> {
    let q = |signal: &str, query: &str| SignalQuery {
        signal: signal.to_string(),
        query: query.to_string(),
    };
    vec![
        q(
            SIGNAL_ACTIVE_CONNECTIONS,
            "SELECT count(*) FROM pg_stat_activity \
             WHERE datname = current_database() AND pid <> pg_backend_pid()",
        ),
        q(
            SIGNAL_STALE_VERSIONS,
            "SELECT count(*) FROM sde.sde_versions \
             WHERE name <> 'DEFAULT' AND creation_time < now() - interval '30 days'",
        ),
        q(
            SIGNAL_DELTA_TABLE_ROWS,
            "SELECT coalesce(sum(n_live_tup), 0) FROM pg_stat_user_tables \
             WHERE relname ~ '^[ad][0-9]+$'",
        ),
        q(
            SIGNAL_DAYS_SINCE_LAST_COMPRESS,
            "SELECT extract(epoch FROM now() - max(compress_end)) / 86400 \
             FROM sde.sde_compress_log",
        ),
        q(SIGNAL_STATE_COUNT, "SELECT count(*) FROM sde.sde_states"),
    ]
}
