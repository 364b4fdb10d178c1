use std::path::PathBuf;

use gdbmaint_core::config::StepSelection;
use gdbmaint_core::error::ConfigurationError;

/// Config path used when neither the CLI argument nor `GDBMAINT_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "config/maintenance.json";

/// Log output format, from `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Worker settings loaded from environment variables.
///
/// | Env Var               | Default                     |
/// |-----------------------|-----------------------------|
/// | `GDBMAINT_CONFIG`     | `config/maintenance.json`   |
/// | `DATABASE_URL`        | required unless dry run     |
/// | `GDBMAINT_DATABASE`   | database named in the URL   |
/// | `GDBMAINT_REPORT_DIR` | no JSON report              |
/// | `GDBMAINT_ONLY_STEPS` | all steps                   |
/// | `GDBMAINT_SKIP_STEPS` | none                        |
/// | `GDBMAINT_DRY_RUN`    | `false`                     |
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub config_path: PathBuf,
    pub database_url: Option<String>,
    /// Database whose connections are gated. `None` only in dry runs.
    pub database: Option<String>,
    pub report_dir: Option<PathBuf>,
    pub selection: StepSelection,
    pub dry_run: bool,
}

impl WorkerSettings {
    /// Load from the process environment. `cli_config` (the first CLI
    /// argument) overrides `GDBMAINT_CONFIG`.
    pub fn from_env(cli_config: Option<String>) -> Result<Self, ConfigurationError> {
        Self::from_lookup(cli_config, |key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup.
    pub fn from_lookup(
        cli_config: Option<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config_path = cli_config
            .or_else(|| var("GDBMAINT_CONFIG"))
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
            .into();

        let dry_run = match var("GDBMAINT_DRY_RUN") {
            None => false,
            Some(v) => parse_bool(&v).ok_or_else(|| {
                ConfigurationError::Validation(format!(
                    "GDBMAINT_DRY_RUN must be true or false, got '{v}'"
                ))
            })?,
        };

        let database_url = var("DATABASE_URL");
        let database = var("GDBMAINT_DATABASE")
            .or_else(|| database_url.as_deref().and_then(gdbmaint_db::database_from_url));

        if !dry_run {
            if database_url.is_none() {
                return Err(ConfigurationError::Validation(
                    "DATABASE_URL must be set".to_string(),
                ));
            }
            match &database {
                Some(name) => gdbmaint_db::ident::validate_database_name(name)?,
                None => {
                    return Err(ConfigurationError::Validation(
                        "GDBMAINT_DATABASE must be set when DATABASE_URL names no database"
                            .to_string(),
                    ))
                }
            }
        }

        Ok(Self {
            config_path,
            database_url,
            database,
            report_dir: var("GDBMAINT_REPORT_DIR").map(PathBuf::from),
            selection: StepSelection::from_lists(
                var("GDBMAINT_ONLY_STEPS").as_deref(),
                var("GDBMAINT_SKIP_STEPS").as_deref(),
            ),
            dry_run,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
