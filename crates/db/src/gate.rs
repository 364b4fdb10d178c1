//! Connection gate over a PostgreSQL database.
//!
//! Blocking sets the database connection limit to 0. Superusers are exempt
//! from the limit, so the maintenance role (which must be a superuser) keeps
//! working while regular clients are refused. Allowing restores the limit
//! recorded at block time.

use async_trait::async_trait;
use gdbmaint_core::error::{ConfigurationError, GateError};
use gdbmaint_core::gate::{ConnectionGate, GateState};

use crate::ident::{quote_ident, validate_database_name};
use crate::DbPool;

/// Limit value meaning "no limit".
const UNLIMITED: i32 = -1;

pub struct PgConnectionGate {
    pool: DbPool,
    database: String,
    /// Connection limit in force before `block()`.
    previous_limit: Option<i32>,
    state: GateState,
}

impl PgConnectionGate {
    pub fn new(pool: DbPool, database: impl Into<String>) -> Result<Self, ConfigurationError> {
        let database = database.into();
        validate_database_name(&database)?;
        Ok(Self {
            pool,
            database,
            previous_limit: None,
            state: GateState::Open,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    async fn current_limit(&self) -> Result<i32, sqlx::Error> {
        sqlx::query_scalar::<_, i32>("SELECT datconnlimit FROM pg_database WHERE datname = $1")
            .bind(&self.database)
            .fetch_one(&self.pool)
            .await
    }

    async fn set_limit(&self, limit: i32) -> Result<(), sqlx::Error> {
        sqlx::query(&set_limit_sql(&self.database, limit))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// `ALTER DATABASE` takes no bind parameters; the name is validated and quoted.
fn set_limit_sql(database: &str, limit: i32) -> String {
    format!(
        "ALTER DATABASE {} WITH CONNECTION LIMIT {limit}",
        quote_ident(database)
    )
}

/// Limit to restore on `allow()`. A limit of 0 found at block time is a
/// leftover from an interrupted run and restores to unlimited.
fn restore_limit(found: i32) -> i32 {
    if found == 0 {
        UNLIMITED
    } else {
        found
    }
}

#[async_trait]
impl ConnectionGate for PgConnectionGate {
    async fn block(&mut self) -> Result<(), GateError> {
        if self.state == GateState::Blocked {
            return Ok(());
        }
        let found = self
            .current_limit()
            .await
            .map_err(|e| GateError::Block(e.to_string()))?;
        self.set_limit(0)
            .await
            .map_err(|e| GateError::Block(e.to_string()))?;

        self.previous_limit = Some(restore_limit(found));
        self.state = GateState::Blocked;
        tracing::info!(database = %self.database, previous_limit = found, "Connection limit set to 0");
        Ok(())
    }

    async fn allow(&mut self) -> Result<(), GateError> {
        if self.state == GateState::Open && self.previous_limit.is_none() {
            tracing::debug!(database = %self.database, "Gate never blocked, limit left unchanged");
            return Ok(());
        }
        let limit = self.previous_limit.unwrap_or(UNLIMITED);
        self.set_limit(limit)
            .await
            .map_err(|e| GateError::Allow(e.to_string()))?;

        self.previous_limit = None;
        self.state = GateState::Open;
        tracing::info!(database = %self.database, limit, "Connection limit restored");
        Ok(())
    }

    fn current_state(&self) -> GateState {
        self.state
    }
}
