//! SQL-backed maintenance operations.

use async_trait::async_trait;
use gdbmaint_core::error::StepExecutionError;
use gdbmaint_core::step::{MaintenanceOperation, StepContext, StepOutput};
use serde_json::json;

use crate::DbPool;

/// SQLSTATE codes for missing privileges or failed authentication.
const UNAUTHORIZED_CODES: &[&str] = &["28000", "28P01", "42501"];

/// SQLSTATE codes worth retrying: serialization failure, deadlock, lock
/// not available, admin shutdown, cannot connect now, too many connections.
const TRANSIENT_CODES: &[&str] = &["40001", "40P01", "55P03", "57P01", "57P03", "53300"];

/// Map a driver error onto the step error taxonomy.
pub fn classify(err: &sqlx::Error) -> StepExecutionError {
    let message = err.to_string();
    match err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code) if UNAUTHORIZED_CODES.contains(&code) => {
                StepExecutionError::Unauthorized(message)
            }
            Some(code) if TRANSIENT_CODES.contains(&code) => StepExecutionError::Transient(message),
            _ => StepExecutionError::Failed(message),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StepExecutionError::Transient(message),
        _ => StepExecutionError::Failed(message),
    }
}

// ---------------------------------------------------------------------------
// SqlOperation
// ---------------------------------------------------------------------------

/// Executes statements in order, each in its own implicit transaction so
/// that `VACUUM` and friends are allowed.
pub struct SqlOperation {
    pool: DbPool,
    statements: Vec<String>,
}

impl SqlOperation {
    pub fn new(pool: DbPool, statements: Vec<String>) -> Self {
        Self { pool, statements }
    }
}

#[async_trait]
impl MaintenanceOperation for SqlOperation {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepExecutionError> {
        let mut rows_affected = 0u64;
        for (i, statement) in self.statements.iter().enumerate() {
            tracing::debug!(step = %ctx.step, statement = i + 1, "Executing SQL statement");
            let result = sqlx::raw_sql(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| classify(&e))?;
            rows_affected += result.rows_affected();
        }
        Ok(StepOutput::detail(json!({
            "statements": self.statements.len(),
            "rows_affected": rows_affected,
        })))
    }
}

// ---------------------------------------------------------------------------
// DisconnectUsersOperation
// ---------------------------------------------------------------------------

/// Terminates other sessions connected to the maintained database.
pub struct DisconnectUsersOperation {
    pool: DbPool,
    database: String,
    exclude_admin: bool,
}

impl DisconnectUsersOperation {
    pub fn new(pool: DbPool, database: impl Into<String>, exclude_admin: bool) -> Self {
        Self {
            pool,
            database: database.into(),
            exclude_admin,
        }
    }
}

/// Sessions on `$1` other than our own, optionally sparing the current role.
fn disconnect_sql(exclude_admin: bool) -> String {
    let mut sql = String::from(
        "SELECT pid, usename::text, pg_terminate_backend(pid) AS terminated \
         FROM pg_stat_activity \
         WHERE datname = $1 AND pid <> pg_backend_pid()",
    );
    if exclude_admin {
        sql.push_str(" AND usename <> current_user");
    }
    sql
}

#[async_trait]
impl MaintenanceOperation for DisconnectUsersOperation {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepExecutionError> {
        let rows: Vec<(i32, Option<String>, bool)> = sqlx::query_as(&disconnect_sql(self.exclude_admin))
            .bind(&self.database)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(&e))?;

        let terminated = rows.iter().filter(|(_, _, ok)| *ok).count();
        let users: Vec<&str> = rows
            .iter()
            .filter_map(|(_, user, _)| user.as_deref())
            .collect();
        tracing::info!(
            step = %ctx.step,
            database = %self.database,
            sessions = rows.len(),
            terminated,
            "Disconnected users",
        );

        Ok(StepOutput::detail(json!({
            "sessions": rows.len(),
            "terminated": terminated,
            "users": users,
        })))
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::error::Error as StdError;

    use assert_matches::assert_matches;
    use sqlx::error::{DatabaseError, ErrorKind};

    use super::*;

    #[derive(Debug)]
    struct CodedError(&'static str);

    impl std::fmt::Display for CodedError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "database error {}", self.0)
        }
    }

    impl StdError for CodedError {}

    impl DatabaseError for CodedError {
        fn message(&self) -> &str {
            "database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    fn db_error(code: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(CodedError(code)))
    }

    #[test]
    fn privilege_errors_are_unauthorized() {
        assert_matches!(classify(&db_error("42501")), StepExecutionError::Unauthorized(_));
        assert_matches!(classify(&db_error("28P01")), StepExecutionError::Unauthorized(_));
    }

    #[test]
    fn lock_and_pool_errors_are_transient() {
        assert_matches!(classify(&db_error("55P03")), StepExecutionError::Transient(_));
        assert_matches!(classify(&db_error("40P01")), StepExecutionError::Transient(_));
        assert_matches!(classify(&sqlx::Error::PoolTimedOut), StepExecutionError::Transient(_));
    }

    #[test]
    fn other_errors_are_permanent() {
        assert_matches!(classify(&db_error("42P01")), StepExecutionError::Failed(_));
        assert_matches!(classify(&sqlx::Error::RowNotFound), StepExecutionError::Failed(_));
    }

    #[test]
    fn disconnect_query_spares_admin_on_request() {
        assert!(disconnect_sql(true).ends_with("AND usename <> current_user"));
        assert!(!disconnect_sql(false).contains("current_user"));
        assert!(disconnect_sql(false).contains("pid <> pg_backend_pid()"));
    }
}
