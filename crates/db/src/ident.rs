//! SQL identifier handling for statements that cannot take bind parameters.

use std::sync::LazyLock;

use gdbmaint_core::error::ConfigurationError;
use regex::Regex;

/// Unquoted-identifier-like names up to PostgreSQL's 63-byte limit.
static DATABASE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$\-]{0,62}$").expect("valid regex")
});

/// Reject database names that are empty, too long or contain characters
/// outside letters, digits, `_`, `$` and `-`.
pub fn validate_database_name(name: &str) -> Result<(), ConfigurationError> {
    if DATABASE_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(ConfigurationError::Validation(format!(
            "Invalid database name '{name}'"
        )))
    }
}

/// Double-quote an identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
