//! External-program maintenance operation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

use super::subprocess::{run_command, CommandError, CommandInput, CommandOutput};
use crate::error::StepExecutionError;
use crate::report::output_preview;
use crate::step::{MaintenanceOperation, StepContext, StepOutput};

/// `EX_NOPERM` from sysexits.h: the tool lacked the privileges it needed.
pub const EXIT_UNAUTHORIZED: i32 = 77;
/// `EX_TEMPFAIL` from sysexits.h: try again later.
pub const EXIT_TEMPFAIL: i32 = 75;

/// Runs a program (typically a geoprocessing script) as one step.
///
/// The child receives `{"run_id", "step", "attempt"}` on stdin. Stdout that
/// parses as JSON becomes the step detail.
#[derive(Debug, Clone)]
pub struct CommandOperation {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_directory: Option<String>,
}

impl CommandOperation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_directory: None,
        }
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn working_directory(mut self, dir: Option<String>) -> Self {
        self.working_directory = dir;
        self
    }
}

#[async_trait]
impl MaintenanceOperation for CommandOperation {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepExecutionError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        let input = CommandInput {
            data: json!({
                "run_id": ctx.run_id,
                "step": ctx.step,
                "attempt": ctx.attempt,
            }),
            env_vars: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            working_directory: self.working_directory.clone(),
            timeout: ctx.timeout,
        };

        tracing::debug!(step = %ctx.step, program = %self.program, "Spawning command");
        let output = run_command(&mut cmd, input).await.map_err(|e| match e {
            CommandError::Timeout { elapsed_ms } => StepExecutionError::Timeout { elapsed_ms },
            CommandError::Io(e) => {
                StepExecutionError::Failed(format!("could not run '{}': {e}", self.program))
            }
        })?;
        if output.truncated {
            tracing::warn!(step = %ctx.step, program = %self.program, "Command output exceeded capture limit");
        }

        classify_exit(output)
    }
}

/// Map a finished process onto a step outcome by exit code.
pub fn classify_exit(output: CommandOutput) -> Result<StepOutput, StepExecutionError> {
    match output.exit_code {
        0 => {
            let detail = output.parsed_output.unwrap_or_else(|| {
                json!({
                    "exit_code": 0,
                    "duration_ms": output.duration_ms,
                    "output_truncated": output.truncated,
                })
            });
            Ok(StepOutput {
                detail,
                output: Some(output.stdout),
            })
        }
        code => {
            let message = failure_message(code, &output.stderr, &output.stdout);
            Err(match code {
                EXIT_UNAUTHORIZED => StepExecutionError::Unauthorized(message),
                EXIT_TEMPFAIL => StepExecutionError::Transient(message),
                _ => StepExecutionError::Failed(message),
            })
        }
    }
}

fn failure_message(code: i32, stderr: &str, stdout: &str) -> String {
    let stream = if stderr.trim().is_empty() { stdout } else { stderr };
    match output_preview(last_line(stream)) {
        Some(line) => format!("exit code {code}: {line}"),
        None => format!("exit code {code}"),
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::scripting::test_helpers::write_temp_script;

    fn ctx(timeout: Duration) -> StepContext {
        StepContext {
            run_id: "run-20261019T020000Z-test".to_string(),
            step: "CompressRebuildAnalyze".to_string(),
            attempt: 1,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    fn bash(script: &tempfile::NamedTempFile) -> CommandOperation {
        CommandOperation::new("bash").args(vec![script.path().display().to_string()])
    }

    fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            duration_ms: 12,
            parsed_output: serde_json::from_str(stdout.trim()).ok(),
            truncated: false,
        }
    }

    #[test]
    fn exit_codes_map_to_error_kinds() {
        assert_matches!(
            classify_exit(output(77, "", "ORA-01017 invalid credentials\n")),
            Err(StepExecutionError::Unauthorized(msg)) if msg == "exit code 77: ORA-01017 invalid credentials"
        );
        assert_matches!(
            classify_exit(output(75, "", "lock held\n")),
            Err(StepExecutionError::Transient(_))
        );
        assert_matches!(
            classify_exit(output(1, "traceback\nValueError: bad version\n", "")),
            Err(StepExecutionError::Failed(msg)) if msg == "exit code 1: ValueError: bad version"
        );
        assert_matches!(
            classify_exit(output(2, "", "")),
            Err(StepExecutionError::Failed(msg)) if msg == "exit code 2"
        );
    }

    #[test]
    fn json_stdout_becomes_detail() {
        let out = classify_exit(output(0, r#"{"versions_deleted": 3}"#, "")).unwrap();
        assert_eq!(out.detail["versions_deleted"], 3);

        let plain = classify_exit(output(0, "done\n", "")).unwrap();
        assert_eq!(plain.detail["exit_code"], 0);
        assert_eq!(plain.output.as_deref(), Some("done\n"));
    }

    #[tokio::test]
    async fn runs_script_with_context_on_stdin() {
        let script = write_temp_script(
            "read -r ctx\necho \"{\\\"received\\\": $ctx, \\\"signals\\\": {\\\"geometry_errors\\\": 2}}\"\n",
        );
        let out = bash(&script)
            .run(&ctx(Duration::from_secs(5)))
            .await
            .expect("run");
        assert_eq!(out.detail["received"]["step"], "CompressRebuildAnalyze");
        assert_eq!(out.detail["received"]["attempt"], 1);
        assert_eq!(out.detail["signals"]["geometry_errors"], 2);
    }

    #[tokio::test]
    async fn configured_env_is_passed() {
        let script = write_temp_script("echo \"{\\\"target\\\": \\\"$SDE_TARGET\\\"}\"\n");
        let op = bash(&script).env(BTreeMap::from([(
            "SDE_TARGET".to_string(),
            "gisprod".to_string(),
        )]));
        let out = op.run(&ctx(Duration::from_secs(5))).await.expect("run");
        assert_eq!(out.detail["target"], "gisprod");
    }

    #[tokio::test]
    async fn verbose_script_still_succeeds() {
        let script = write_temp_script("head -c 11000000 /dev/zero | tr '\\0' x\nexit 0\n");
        let output = bash(&script)
            .run(&ctx(Duration::from_secs(30)))
            .await
            .expect("verbose tool exits cleanly");

        assert_eq!(output.detail["exit_code"], 0);
        assert_eq!(output.detail["output_truncated"], true);
        assert_eq!(
            output.output.map(|o| o.len()),
            Some(crate::scripting::subprocess::MAX_OUTPUT_BYTES)
        );
    }

    #[tokio::test]
    async fn slow_script_times_out() {
        let script = write_temp_script("sleep 30\n");
        let err = bash(&script)
            .run(&ctx(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_matches!(err, StepExecutionError::Timeout { .. });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn missing_program_fails_permanently() {
        let err = CommandOperation::new("/nonexistent/reconcile")
            .run(&ctx(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_matches!(err, StepExecutionError::Failed(msg) if msg.contains("/nonexistent/reconcile"));
    }
}
