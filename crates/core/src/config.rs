//! Pipeline configuration: ordered steps, scoring table, gate-restore policy.
//!
//! Parsed from JSON and validated as a whole before anything touches the
//! database. Nothing here performs I/O beyond reading the config text.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::health::ScoringConfig;
use crate::retry::RetryPolicy;
use crate::signals::DEFAULT_SIGNAL_TIMEOUT;
use crate::step::{StepWindow, DEFAULT_STEP_TIMEOUT};

// ---------------------------------------------------------------------------
// Operation kinds
// ---------------------------------------------------------------------------

/// Which concrete collaborator a step invokes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationSpec {
    /// Run an external program or script.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        working_directory: Option<String>,
    },
    /// Execute SQL statements against the maintained database.
    Sql { statements: Vec<String> },
    /// Terminate other sessions on the maintained database.
    DisconnectUsers {
        #[serde(default = "default_true")]
        exclude_admin: bool,
    },
    /// Call a remote service endpoint.
    HttpCheck {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        /// Environment variable holding a bearer token.
        #[serde(default)]
        token_env: Option<String>,
    },
}

impl OperationSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Sql { .. } => "sql",
            Self::DisconnectUsers { .. } => "disconnect_users",
            Self::HttpCheck { .. } => "http_check",
        }
    }

    fn validate(&self, step: &str) -> Result<(), ConfigurationError> {
        let invalid = |msg: &str| ConfigurationError::Validation(format!("Step '{step}': {msg}"));
        match self {
            Self::Command { program, .. } if program.trim().is_empty() => {
                Err(invalid("command program must not be empty"))
            }
            Self::Sql { statements } if statements.is_empty() => {
                Err(invalid("sql operation needs at least one statement"))
            }
            Self::Sql { statements } if statements.iter().any(|s| s.trim().is_empty()) => {
                Err(invalid("sql statements must not be empty"))
            }
            Self::HttpCheck { url, .. }
                if !(url.starts_with("http://") || url.starts_with("https://")) =>
            {
                Err(invalid("http_check url must start with http:// or https://"))
            }
            Self::HttpCheck { method, .. }
                if !VALID_HTTP_METHODS.contains(&method.to_ascii_uppercase().as_str()) =>
            {
                Err(invalid(&format!(
                    "unsupported http method '{method}'. Valid methods: {}",
                    VALID_HTTP_METHODS.join(", ")
                )))
            }
            _ => Ok(()),
        }
    }
}

/// HTTP methods accepted by `http_check` operations.
pub const VALID_HTTP_METHODS: &[&str] = &["GET", "POST", "HEAD"];

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_STEP_TIMEOUT.as_secs()
}

fn default_signal_timeout_secs() -> u64 {
    DEFAULT_SIGNAL_TIMEOUT.as_secs()
}

// ---------------------------------------------------------------------------
// Step and pipeline config
// ---------------------------------------------------------------------------

/// One pipeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    /// Abort remaining steps when this one fails.
    #[serde(default)]
    pub fatal: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub window: StepWindow,
    /// Steps that must have succeeded before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Environment variables that must be set, otherwise the step is skipped.
    #[serde(default)]
    pub requires_env: Vec<String>,
    pub operation: OperationSpec,
}

impl StepConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A named SQL query producing one numeric signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalQuery {
    pub signal: String,
    pub query: String,
}

/// The whole externally supplied configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default = "RetryPolicy::gate_restore_default")]
    pub gate_restore: RetryPolicy,
    /// Signal queries; `None` uses the database crate's defaults.
    #[serde(default)]
    pub signal_queries: Option<Vec<SignalQuery>>,
    #[serde(default = "default_signal_timeout_secs")]
    pub signal_timeout_secs: u64,
}

impl PipelineConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self, ConfigurationError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn signal_timeout(&self) -> Duration {
        Duration::from_secs(self.signal_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_pipeline(
            self.steps
                .iter()
                .map(|s| (s.name.as_str(), s.window, s.depends_on.as_slice())),
        )?;
        for step in &self.steps {
            step.retry
                .validate()
                .map_err(|reason| ConfigurationError::InvalidRetryPolicy {
                    step: step.name.clone(),
                    reason,
                })?;
            if step.timeout_secs == 0 {
                return Err(ConfigurationError::Validation(format!(
                    "Step '{}': timeout_secs must be greater than 0",
                    step.name
                )));
            }
            step.operation.validate(&step.name)?;
        }
        self.gate_restore
            .validate()
            .map_err(|reason| ConfigurationError::InvalidRetryPolicy {
                step: "gate_restore".to_string(),
                reason,
            })?;
        if self.signal_timeout_secs == 0 {
            return Err(ConfigurationError::Validation(
                "signal_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(queries) = &self.signal_queries {
            let mut seen = HashSet::new();
            for q in queries {
                if q.signal.trim().is_empty() || q.query.trim().is_empty() {
                    return Err(ConfigurationError::Validation(
                        "signal queries need a signal name and a query".to_string(),
                    ));
                }
                if !seen.insert(q.signal.as_str()) {
                    return Err(ConfigurationError::Validation(format!(
                        "signal '{}' has more than one query",
                        q.signal
                    )));
                }
            }
        }
        self.scoring.validate()
    }
}

/// Check step names, dependency ordering and window ordering.
///
/// Names must be non-empty and unique, every dependency must name an
/// earlier step, and all maintenance-window steps must precede the
/// post-restore steps.
pub fn validate_pipeline<'a>(
    steps: impl IntoIterator<Item = (&'a str, StepWindow, &'a [String])>,
) -> Result<(), ConfigurationError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut after_restore_seen = false;

    for (index, (name, window, depends_on)) in steps.into_iter().enumerate() {
        if name.trim().is_empty() {
            return Err(ConfigurationError::EmptyStepName { index });
        }
        if seen.contains(name) {
            return Err(ConfigurationError::DuplicateStepName(name.to_string()));
        }
        for dep in depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(ConfigurationError::InvalidOrdering {
                    step: name.to_string(),
                    dependency: dep.clone(),
                });
            }
        }
        match window {
            StepWindow::AfterRestore => after_restore_seen = true,
            StepWindow::Maintenance if after_restore_seen => {
                return Err(ConfigurationError::WindowOrdering {
                    step: name.to_string(),
                });
            }
            StepWindow::Maintenance => {}
        }
        seen.insert(name);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Step selection
// ---------------------------------------------------------------------------

/// Operator restriction of which configured steps run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSelection {
    only: Option<Vec<String>>,
    skip: Vec<String>,
}

impl StepSelection {
    /// Run every step.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build from comma-separated lists, as supplied through the environment.
    pub fn from_lists(only: Option<&str>, skip: Option<&str>) -> Self {
        Self {
            only: only.map(split_names).filter(|v| !v.is_empty()),
            skip: skip.map(split_names).unwrap_or_default(),
        }
    }

    /// Every selected name must be a configured step.
    pub fn validate<'a>(
        &self,
        step_names: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ConfigurationError> {
        let known: HashSet<&str> = step_names.into_iter().collect();
        for name in self.only.iter().flatten().chain(self.skip.iter()) {
            if !known.contains(name.as_str()) {
                return Err(ConfigurationError::UnknownStep(name.clone()));
            }
        }
        Ok(())
    }

    /// Why `name` must not run, if it is deselected.
    pub fn skip_reason(&self, name: &str) -> Option<&'static str> {
        if let Some(only) = &self.only {
            if !only.iter().any(|n| n == name) {
                return Some("not selected");
            }
        }
        if self.skip.iter().any(|n| n == name) {
            return Some("skipped by operator");
        }
        None
    }
}

fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
